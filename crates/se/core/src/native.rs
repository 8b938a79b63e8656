//! Interfaces consumed from the native smartcard layer
//!
//! The engine treats the driver as an opaque synchronous library. Any call
//! here may block and may fail with a coded [`NativeError`]; the engine never
//! invokes the blocking ones from the caller's context.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::NativeError;

/// Presence change reported for a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum PresenceKind {
    /// A secure element became present in the reader
    #[display("present")]
    Present,
    /// The secure element became absent
    #[display("absent")]
    Absent,
}

/// Entry point of a native driver
pub trait SeDriver: Send + Sync + fmt::Debug {
    /// Start connecting to the native service
    ///
    /// Must not block on the service: completion is reported later through
    /// [`NativeEventHandler::service_connected`], typically from a driver
    /// owned thread.
    fn connect(
        &self,
        events: Arc<dyn NativeEventHandler>,
    ) -> Result<Arc<dyn NativeConnection>, NativeError>;
}

/// Callbacks delivered by the native layer, from its own threads
pub trait NativeEventHandler: Send + Sync {
    /// The connection to the native service is ready
    fn service_connected(&self);

    /// The presence of a secure element changed
    fn presence_changed(&self, reader: &str, kind: PresenceKind);

    /// The native service reported an asynchronous failure
    fn service_error(&self, error: NativeError) {
        tracing::error!(%error, "Native service error");
    }
}

/// An established connection to the native service
pub trait NativeConnection: Send + Sync + fmt::Debug {
    /// Enumerate the readers known to the service
    fn readers(&self) -> Result<Vec<Arc<dyn NativeReader>>, NativeError>;

    /// Tear the connection down, closing everything opened through it
    fn shutdown(&self) -> Result<(), NativeError>;
}

/// A physical or virtual reader
pub trait NativeReader: Send + Sync + fmt::Debug {
    /// Reader name
    fn name(&self) -> String;

    /// Whether a secure element is currently present
    fn is_present(&self) -> bool;

    /// Open a session with the secure element (blocking)
    fn open_session(&self) -> Result<Arc<dyn NativeSession>, NativeError>;

    /// Close every session opened on this reader
    fn close_sessions(&self) -> Result<(), NativeError>;
}

/// A session with a secure element
pub trait NativeSession: Send + Sync + fmt::Debug {
    /// Open the basic channel and select `aid` on it (blocking)
    fn open_basic_channel(&self, aid: &[u8]) -> Result<Arc<dyn NativeChannel>, NativeError>;

    /// Open a logical channel and select `aid` on it (blocking)
    fn open_logical_channel(&self, aid: &[u8]) -> Result<Arc<dyn NativeChannel>, NativeError>;

    /// Answer To Reset of the card
    fn atr(&self) -> Result<Bytes, NativeError>;

    /// Close the session and every channel opened from it
    fn close(&self) -> Result<(), NativeError>;

    /// Close every channel opened from this session
    fn close_channels(&self) -> Result<(), NativeError>;

    /// Whether the session is closed
    fn is_closed(&self) -> bool;
}

/// A basic or logical channel to an applet
pub trait NativeChannel: Send + Sync + fmt::Debug {
    /// Send a command APDU and return the response APDU (blocking)
    fn transmit(&self, command: &[u8]) -> Result<Bytes, NativeError>;

    /// Response to the SELECT command that opened the channel
    fn select_response(&self) -> Result<Bytes, NativeError>;

    /// Close the channel
    fn close(&self) -> Result<(), NativeError>;

    /// Whether the channel is closed
    fn is_closed(&self) -> bool;

    /// Whether this is the basic channel
    fn is_basic(&self) -> bool;
}
