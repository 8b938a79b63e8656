//! Error taxonomy for secure element operations
//!
//! Native drivers report failures with a [`NativeErrorCode`]. Every code is
//! folded into exactly one [`ErrorKind`] by a single exhaustive mapping, and
//! callers only ever see [`SeError`], which carries the kind and a message.

use std::fmt;

/// Coded failure reported by the native smartcard layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorCode {
    /// Inter-process communication with the smartcard daemon failed
    IpcFailed,
    /// I/O with the reader or card failed
    IoFailed,
    /// The operation did not complete in time
    OperationTimeout,
    /// The caller is not allowed to perform the operation
    SecurityNotAllowed,
    /// The requested resource is unavailable
    Unavailable,
    /// The request is not supported by the driver
    NotSupported,
    /// The driver has not been initialized
    NotInitialized,
    /// The secure element has not been initialized
    SeNotInitialized,
    /// The object is in a state that does not allow the operation
    IllegalState,
    /// The operation is not supported by the secure element
    OperationNotSupported,
    /// A parameter was rejected
    IllegalParam,
    /// A referenced object (applet, channel, ...) does not exist
    IllegalReference,
    /// Any other driver specific code
    Other(i32),
}

impl fmt::Display for NativeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "Other({code})"),
            code => fmt::Debug::fmt(code, f),
        }
    }
}

/// Error produced by a native driver call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct NativeError {
    code: NativeErrorCode,
    message: String,
}

impl NativeError {
    /// Create a new native error
    pub fn new<S: Into<String>>(code: NativeErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The native error code
    pub const fn code(&self) -> NativeErrorCode {
        self.code
    }

    /// The driver supplied message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Category of a secure element error, as delivered to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ErrorKind {
    /// Communication failure
    #[display("IOError")]
    Io,
    /// Permission denied
    #[display("SecurityError")]
    Security,
    /// The object or service is not in a usable state
    #[display("InvalidStateError")]
    InvalidState,
    /// An argument was rejected
    #[display("InvalidValuesError")]
    InvalidValues,
    /// Anything else
    #[display("UnknownError")]
    Unknown,
}

impl ErrorKind {
    /// Name of the error category
    pub const fn name(self) -> &'static str {
        match self {
            Self::Io => "IOError",
            Self::Security => "SecurityError",
            Self::InvalidState => "InvalidStateError",
            Self::InvalidValues => "InvalidValuesError",
            Self::Unknown => "UnknownError",
        }
    }
}

impl From<NativeErrorCode> for ErrorKind {
    fn from(code: NativeErrorCode) -> Self {
        match code {
            NativeErrorCode::IpcFailed
            | NativeErrorCode::IoFailed
            | NativeErrorCode::OperationTimeout => Self::Io,
            NativeErrorCode::SecurityNotAllowed => Self::Security,
            NativeErrorCode::Unavailable
            | NativeErrorCode::NotSupported
            | NativeErrorCode::NotInitialized
            | NativeErrorCode::SeNotInitialized
            | NativeErrorCode::IllegalState
            | NativeErrorCode::OperationNotSupported => Self::InvalidState,
            NativeErrorCode::IllegalParam | NativeErrorCode::IllegalReference => {
                Self::InvalidValues
            }
            NativeErrorCode::Other(_) => Self::Unknown,
        }
    }
}

/// Caller visible error of every secure element operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SeError {
    kind: ErrorKind,
    message: String,
}

impl SeError {
    /// Create a new error of the given kind
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an [`ErrorKind::Io`] error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// Create an [`ErrorKind::InvalidState`] error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// Create an [`ErrorKind::InvalidValues`] error
    pub fn invalid_values<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidValues, message)
    }

    /// Create an [`ErrorKind::Unknown`] error
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Translate a native failure of `operation` through the error taxonomy
    pub fn from_native(error: &NativeError, operation: &str) -> Self {
        let kind = ErrorKind::from(error.code());
        Self::new(kind, format!("Failed {operation}: {error}"))
    }

    /// Report a native failure of a synchronous accessor as an unknown error
    pub(crate) fn unknown_native(error: &NativeError, operation: &str) -> Self {
        Self::unknown(format!("Error during {operation}: {}", error.message()))
    }

    /// Error category
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Error category name (`"IOError"`, `"InvalidValuesError"`, ...)
    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<NativeError> for SeError {
    fn from(error: NativeError) -> Self {
        Self::new(ErrorKind::from(error.code()), error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_mapping() {
        use NativeErrorCode::*;

        for code in [IpcFailed, IoFailed, OperationTimeout] {
            assert_eq!(ErrorKind::from(code), ErrorKind::Io);
        }
        assert_eq!(ErrorKind::from(SecurityNotAllowed), ErrorKind::Security);
        for code in [
            Unavailable,
            NotSupported,
            NotInitialized,
            SeNotInitialized,
            IllegalState,
            OperationNotSupported,
        ] {
            assert_eq!(ErrorKind::from(code), ErrorKind::InvalidState);
        }
        for code in [IllegalParam, IllegalReference] {
            assert_eq!(ErrorKind::from(code), ErrorKind::InvalidValues);
        }
        assert_eq!(ErrorKind::from(Other(-42)), ErrorKind::Unknown);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::Io.to_string(), "IOError");
        assert_eq!(ErrorKind::InvalidValues.name(), "InvalidValuesError");
        assert_eq!(ErrorKind::Unknown.to_string(), ErrorKind::Unknown.name());
    }

    #[test]
    fn test_from_native_keeps_context() {
        let native = NativeError::new(NativeErrorCode::OperationTimeout, "card did not answer");
        let error = SeError::from_native(&native, "transmit");

        assert_eq!(error.kind(), ErrorKind::Io);
        assert_eq!(error.name(), "IOError");
        assert!(error.message().contains("transmit"));
        assert!(error.message().contains("card did not answer"));
    }

    #[test]
    fn test_display() {
        let error = SeError::invalid_values("wrong AID length");
        assert_eq!(error.to_string(), "InvalidValuesError: wrong AID length");
    }
}
