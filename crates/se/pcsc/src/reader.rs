//! PC/SC reader

use std::ffi::CString;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use nexum_se_core::{NativeError, NativeReader, NativeSession};
use parking_lot::Mutex;
use pcsc::{Context, ReaderState, State};
use tracing::{debug, warn};

use crate::config::PcscConfig;
use crate::error::PcscError;
use crate::session::PcscSession;

/// A reader known to the PC/SC service
pub(crate) struct PcscReader {
    context: Context,
    name: String,
    config: PcscConfig,
    sessions: Mutex<Vec<Weak<PcscSession>>>,
}

impl fmt::Debug for PcscReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscReader")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscReader {
    pub(crate) fn new(context: Context, name: String, config: PcscConfig) -> Self {
        Self {
            context,
            name,
            config,
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn c_name(&self) -> Result<CString, PcscError> {
        CString::new(self.name.clone()).map_err(|_| PcscError::ReaderNotFound(self.name.clone()))
    }

    fn state(&self) -> Result<State, PcscError> {
        let mut states = [ReaderState::new(self.c_name()?, State::UNAWARE)];
        self.context
            .get_status_change(Some(Duration::ZERO), &mut states)?;
        Ok(states[0].event_state())
    }

    fn connect(&self) -> Result<Arc<PcscSession>, PcscError> {
        let card = match self.context.connect(
            &self.c_name()?,
            self.config.share_mode.into(),
            self.config.protocols,
        ) {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard) => return Err(PcscError::NoCard(self.name.clone())),
            Err(e) => return Err(e.into()),
        };
        let atr = card.get_attribute_owned(pcsc::Attribute::AtrString)?;
        debug!(reader = %self.name, atr = %hex::encode(&atr), "Connected to card");

        let session = PcscSession::new(self.name.clone(), card, Bytes::from(atr));
        let mut sessions = self.sessions.lock();
        sessions.retain(|session| session.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        Ok(session)
    }

    /// Close every session opened on this reader
    pub(crate) fn close_all(&self) -> Result<(), NativeError> {
        let sessions: Vec<_> = std::mem::take(&mut *self.sessions.lock())
            .into_iter()
            .filter_map(|session| session.upgrade())
            .collect();

        let mut result = Ok(());
        for session in sessions {
            if let Err(error) = session.close() {
                warn!(%error, reader = %self.name, "Failed to close session");
                result = Err(error);
            }
        }
        result
    }
}

impl NativeReader for PcscReader {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_present(&self) -> bool {
        match self.state() {
            Ok(state) => state.contains(State::PRESENT),
            Err(error) => {
                debug!(%error, reader = %self.name, "Failed to query reader state");
                false
            }
        }
    }

    fn open_session(&self) -> Result<Arc<dyn NativeSession>, NativeError> {
        Ok(self.connect()?)
    }

    fn close_sessions(&self) -> Result<(), NativeError> {
        self.close_all()
    }
}
