//! Error types for the PC/SC driver

use nexum_se_core::{NativeError, NativeErrorCode};

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Reader name cannot be passed to PC/SC
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// The card answered with an error status word
    #[error("{command} failed with status {sw:04X}")]
    Status {
        /// Command that failed
        command: &'static str,
        /// Status word returned by the card
        sw: u16,
    },

    /// Response shorter than a status word
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Command APDU rejected before reaching the card
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The basic channel is already open
    #[error("Basic channel is already open")]
    BasicChannelBusy,

    /// The session has been closed
    #[error("Session is closed")]
    SessionClosed,

    /// The channel has been closed
    #[error("Channel is closed")]
    ChannelClosed,

    /// A driver thread could not be started
    #[error("Failed to start thread: {0}")]
    Thread(#[source] std::io::Error),
}

impl PcscError {
    /// Native code reported to the service for this error
    pub const fn code(&self) -> NativeErrorCode {
        match self {
            Self::Pcsc(error) => pcsc_code(*error),
            Self::ReaderNotFound(_) => NativeErrorCode::IllegalReference,
            Self::NoCard(_) | Self::BasicChannelBusy => NativeErrorCode::Unavailable,
            Self::Status { sw, .. } => status_code(*sw),
            Self::InvalidResponse(_) => NativeErrorCode::IoFailed,
            Self::InvalidCommand(_) => NativeErrorCode::IllegalParam,
            Self::SessionClosed | Self::ChannelClosed => NativeErrorCode::IllegalState,
            Self::Thread(_) => NativeErrorCode::NotInitialized,
        }
    }
}

impl From<PcscError> for NativeError {
    fn from(error: PcscError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

const fn pcsc_code(error: pcsc::Error) -> NativeErrorCode {
    use pcsc::Error;

    match error {
        Error::NoService | Error::ServiceStopped | Error::CommError | Error::NoReadersAvailable => {
            NativeErrorCode::IpcFailed
        }
        Error::RemovedCard
        | Error::ResetCard
        | Error::UnpoweredCard
        | Error::UnresponsiveCard
        | Error::CardUnsupported => NativeErrorCode::IoFailed,
        Error::Timeout => NativeErrorCode::OperationTimeout,
        Error::SharingViolation
        | Error::NoSmartcard
        | Error::ReaderUnavailable
        | Error::NotReady => NativeErrorCode::Unavailable,
        Error::InvalidParameter | Error::InvalidValue | Error::InsufficientBuffer => {
            NativeErrorCode::IllegalParam
        }
        Error::InvalidHandle | Error::UnknownReader | Error::UnknownCard => {
            NativeErrorCode::IllegalReference
        }
        Error::ProtoMismatch | Error::UnsupportedFeature | Error::UnsupportedCard => {
            NativeErrorCode::NotSupported
        }
        Error::SecurityViolation | Error::ChvBlocked | Error::WrongChv => {
            NativeErrorCode::SecurityNotAllowed
        }
        other => NativeErrorCode::Other(other as i32),
    }
}

const fn status_code(sw: u16) -> NativeErrorCode {
    match sw {
        0x6A82 | 0x6999 => NativeErrorCode::IllegalReference,
        0x6982 | 0x6985 => NativeErrorCode::SecurityNotAllowed,
        0x6881 | 0x6A81 => NativeErrorCode::NotSupported,
        0x6D00 | 0x6E00 => NativeErrorCode::OperationNotSupported,
        0x6A84 => NativeErrorCode::Unavailable,
        0x6700 | 0x6A80 | 0x6A86 => NativeErrorCode::IllegalParam,
        sw => NativeErrorCode::Other(sw as i32),
    }
}
