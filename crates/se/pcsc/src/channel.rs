//! Basic and logical channels on a PC/SC card

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use nexum_se_core::{NativeChannel, NativeError, NativeSession};
use tracing::debug;

use crate::apdu;
use crate::error::PcscError;
use crate::session::PcscSession;

/// Channel `number` of a session, 0 being the basic channel
#[derive(Debug)]
pub(crate) struct PcscChannel {
    session: Weak<PcscSession>,
    number: u8,
    select_response: Bytes,
    closed: AtomicBool,
}

impl PcscChannel {
    pub(crate) const fn new(session: Weak<PcscSession>, number: u8, select_response: Bytes) -> Self {
        Self {
            session,
            number,
            select_response,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) const fn number(&self) -> u8 {
        self.number
    }

    fn session(&self) -> Result<Arc<PcscSession>, PcscError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PcscError::ChannelClosed);
        }
        match self.session.upgrade() {
            Some(session) if !session.is_closed() => Ok(session),
            _ => Err(PcscError::SessionClosed),
        }
    }

    /// Mark the channel closed and give the number back to the card
    ///
    /// The basic channel cannot be closed on the card; it only becomes
    /// available for the next open.
    pub(crate) fn shut(&self) -> Result<(), PcscError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        session.release(self.number);
        debug!(reader = session.reader_name(), number = self.number, "Closed channel");

        if self.number == 0 {
            return Ok(());
        }
        let response = session.exchange(&apdu::manage_channel_close(self.number))?;
        match apdu::split(&response)? {
            (_, apdu::SW_OK) => Ok(()),
            (_, sw) => Err(PcscError::Status {
                command: "MANAGE CHANNEL",
                sw,
            }),
        }
    }

    fn transmit_on_channel(&self, command: &[u8]) -> Result<Bytes, PcscError> {
        let session = self.session()?;
        if command.len() < 4 {
            return Err(PcscError::InvalidCommand(format!(
                "command {} is shorter than a header",
                hex::encode(command)
            )));
        }

        let mut command = BytesMut::from(command);
        command[0] = apdu::with_channel(command[0], self.number);
        session.exchange(&command)
    }
}

impl NativeChannel for PcscChannel {
    fn transmit(&self, command: &[u8]) -> Result<Bytes, NativeError> {
        self.transmit_on_channel(command).map_err(Into::into)
    }

    fn select_response(&self) -> Result<Bytes, NativeError> {
        Ok(self.select_response.clone())
    }

    fn close(&self) -> Result<(), NativeError> {
        self.shut().map_err(Into::into)
    }

    fn is_closed(&self) -> bool {
        self.session().is_err()
    }

    fn is_basic(&self) -> bool {
        self.number == 0
    }
}
