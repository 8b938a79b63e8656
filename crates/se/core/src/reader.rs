//! Reader wrapper handed to callers

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, instrument, warn};

use crate::arena::SlotKey;
use crate::callback::{Completion, OpenSessionCallbackData, OpenSessionParams};
use crate::error::SeError;
use crate::native::NativeReader;
use crate::service::{ServiceShared, upgrade};
use crate::session::Session;

/// Handle of a reader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("reader#{_0}")]
pub struct ReaderId(pub(crate) SlotKey);

struct ReaderInner {
    service: Weak<ServiceShared>,
    id: ReaderId,
    name: String,
}

/// A physical or virtual reader
///
/// Cloning is cheap; all clones refer to the same reader slot. The handle
/// stops working once the service is shut down or dropped.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Reader {
    pub(crate) fn new(service: Weak<ServiceShared>, id: ReaderId, name: String) -> Self {
        Self {
            inner: Arc::new(ReaderInner { service, id, name }),
        }
    }

    pub(crate) fn service(&self) -> &Weak<ServiceShared> {
        &self.inner.service
    }

    /// Slot of this reader
    pub fn id(&self) -> ReaderId {
        self.inner.id
    }

    /// Reader name captured at enumeration
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether a secure element is currently in the reader
    pub fn is_present(&self) -> Result<bool, SeError> {
        Ok(self.native()?.is_present())
    }

    /// Open a session with the secure element in this reader
    ///
    /// The session is delivered through `completion`. An error returned here
    /// means the request was not accepted and no callback will fire.
    #[instrument(level = "trace", skip_all, fields(reader = %self.inner.name))]
    pub fn open_session(&self, completion: Completion<Session>) -> Result<(), SeError> {
        let service = upgrade(&self.inner.service)?;
        let (token, epoch) = service.job_token();
        let carrier = OpenSessionCallbackData::new(
            OpenSessionParams {
                reader: self.inner.id,
            },
            completion,
        );

        let reader = self.clone();
        service
            .runner()
            .spawn("opening session", token, carrier, move |params| {
                let service = upgrade(reader.service())?;
                let native = service.resources().reader(params.reader)?;
                let session = native
                    .open_session()
                    .map_err(|e| SeError::from_native(&e, "opening session"))?;

                let registered = service.resources().insert_session(epoch, params.reader, &session);
                match registered {
                    Ok(id) => {
                        debug!(reader = reader.name(), session = %id, "Session opened");
                        Ok(Session::new(reader, id))
                    }
                    Err(err) => {
                        if let Err(error) = session.close() {
                            warn!(%error, "Failed to close orphaned session");
                        }
                        Err(err)
                    }
                }
            })
    }

    /// Close every session opened on this reader
    pub fn close_sessions(&self) -> Result<(), SeError> {
        self.native()?
            .close_sessions()
            .map_err(|e| SeError::unknown_native(&e, "closing sessions"))
    }

    fn native(&self) -> Result<Arc<dyn NativeReader>, SeError> {
        upgrade(&self.inner.service)?
            .resources()
            .reader(self.inner.id)
    }
}
