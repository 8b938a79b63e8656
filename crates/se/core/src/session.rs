//! Card session wrapper handed to callers

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, instrument, trace, warn};

use crate::arena::SlotKey;
use crate::callback::{Completion, OpenChannelCallbackData, OpenChannelParams};
use crate::channel::Channel;
use crate::error::SeError;
use crate::native::NativeSession;
use crate::reader::Reader;
use crate::service::{ServiceShared, upgrade};

/// Shortest AID accepted when opening a channel
pub const MIN_AID_LEN: usize = 5;

/// Longest AID accepted when opening a channel
pub const MAX_AID_LEN: usize = 16;

/// Handle of a session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("session#{_0}")]
pub struct SessionId(pub(crate) SlotKey);

/// An open session with the secure element of a [`Reader`]
///
/// Dropping the session closes it.
pub struct Session {
    reader: Reader,
    id: SessionId,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("reader", &self.reader.name())
            .finish()
    }
}

impl Session {
    pub(crate) const fn new(reader: Reader, id: SessionId) -> Self {
        Self { reader, id }
    }

    /// Slot of this session
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Reader the session was opened on
    pub const fn reader(&self) -> &Reader {
        &self.reader
    }

    /// Open a channel and select `aid` on it
    ///
    /// `aid` must be 5 to 16 bytes long, otherwise an
    /// [`InvalidValues`](crate::ErrorKind::InvalidValues) error is returned
    /// right away and no callback fires.
    #[instrument(level = "trace", skip_all, fields(session = %self.id, aid = %hex::encode(aid), basic = basic))]
    pub fn open_channel(
        &self,
        aid: &[u8],
        basic: bool,
        completion: Completion<Channel>,
    ) -> Result<(), SeError> {
        if !(MIN_AID_LEN..=MAX_AID_LEN).contains(&aid.len()) {
            debug!(len = aid.len(), "Rejecting AID");
            return Err(SeError::invalid_values("wrong AID length"));
        }

        let service = upgrade(self.reader.service())?;
        let (token, epoch) = service.job_token();
        let carrier = OpenChannelCallbackData::new(
            OpenChannelParams {
                session: self.id,
                aid: Bytes::copy_from_slice(aid),
                basic,
            },
            completion,
        );
        let operation = if basic {
            "opening basic channel"
        } else {
            "opening logical channel"
        };

        let weak = self.reader.service().clone();
        service.runner().spawn(operation, token, carrier, move |params| {
            open_channel(&weak, epoch, operation, params)
        })
    }

    /// Open the basic channel and select `aid` on it
    pub fn open_basic_channel(
        &self,
        aid: &[u8],
        completion: Completion<Channel>,
    ) -> Result<(), SeError> {
        self.open_channel(aid, true, completion)
    }

    /// Open a logical channel and select `aid` on it
    pub fn open_logical_channel(
        &self,
        aid: &[u8],
        completion: Completion<Channel>,
    ) -> Result<(), SeError> {
        self.open_channel(aid, false, completion)
    }

    /// Answer To Reset of the card
    pub fn atr(&self) -> Result<Bytes, SeError> {
        self.native()?
            .atr()
            .map_err(|e| SeError::unknown_native(&e, "getting ATR"))
    }

    /// Close the session and all of its channels
    ///
    /// Does nothing when the session is already closed or stale.
    pub fn close(&self) -> Result<(), SeError> {
        let Ok(native) = self.native() else {
            return Ok(());
        };
        if native.is_closed() {
            return Ok(());
        }
        native
            .close()
            .map_err(|e| SeError::unknown_native(&e, "closing session"))
    }

    /// Close every channel opened on this session
    pub fn close_channels(&self) -> Result<(), SeError> {
        self.native()?
            .close_channels()
            .map_err(|e| SeError::unknown_native(&e, "closing channels"))
    }

    /// Whether the session is closed
    ///
    /// A session that outlived a service shutdown reports closed.
    pub fn is_closed(&self) -> bool {
        self.native().map_or(true, |native| native.is_closed())
    }

    fn native(&self) -> Result<Arc<dyn NativeSession>, SeError> {
        upgrade(self.reader.service())?.resources().session(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(service) = self.reader.service().upgrade() else {
            return;
        };
        let Some(native) = service.resources().remove_session(self.id) else {
            return;
        };
        if !native.is_closed() {
            trace!(session = %self.id, "Closing dropped session");
            if let Err(error) = native.close() {
                warn!(session = %self.id, %error, "Failed to close dropped session");
            }
        }
    }
}

fn open_channel(
    service: &Weak<ServiceShared>,
    epoch: u64,
    operation: &'static str,
    params: &OpenChannelParams,
) -> Result<Channel, SeError> {
    let service = upgrade(service)?;
    let session = service.resources().session(params.session)?;
    if session.is_closed() {
        return Err(SeError::invalid_state("session is closed"));
    }

    let opened = if params.basic {
        session.open_basic_channel(&params.aid)
    } else {
        session.open_logical_channel(&params.aid)
    };
    let native = opened.map_err(|e| SeError::from_native(&e, operation))?;

    let registered = service
        .resources()
        .insert_channel(epoch, params.session, &native);
    match registered {
        Ok(id) => {
            debug!(session = %params.session, channel = %id, "Channel opened");
            Ok(Channel::new(Arc::downgrade(&service), id, native.is_basic()))
        }
        Err(err) => {
            if let Err(error) = native.close() {
                warn!(%error, "Failed to close orphaned channel");
            }
            Err(err)
        }
    }
}
