//! Per operation result carriers
//!
//! A [`CallbackData`] travels from the caller to a worker and back to the
//! main loop. It holds the immutable request parameters, the caller's
//! [`Completion`] and, once the worker is done, either the result or the
//! error to deliver.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::context::{ContextId, ContextLiveness};
use crate::error::SeError;
use crate::{Channel, ChannelId, Reader, ReaderId, Session, SessionId};

type SuccessFn<T> = Box<dyn FnOnce(T) + Send + 'static>;
type ErrorFn = Box<dyn FnOnce(SeError) + Send + 'static>;

/// Success and error callbacks bound to a caller context
pub struct Completion<T> {
    context: ContextId,
    on_success: SuccessFn<T>,
    on_error: ErrorFn,
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<T> Completion<T> {
    /// Bind a success/error callback pair to `context`
    pub fn new<S, E>(context: ContextId, on_success: S, on_error: E) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(SeError) + Send + 'static,
    {
        Self {
            context,
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }

    /// Context the callbacks belong to
    pub const fn context(&self) -> ContextId {
        self.context
    }
}

/// What happened when a carrier reached the main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The success callback ran
    Success,
    /// The error callback ran
    Error,
    /// The context was gone; no callback ran
    Dropped,
}

/// Request parameters, caller callbacks and the outcome of one operation
pub struct CallbackData<P, T> {
    params: P,
    completion: Completion<T>,
    outcome: Option<Result<T, SeError>>,
}

impl<P: fmt::Debug, T> fmt::Debug for CallbackData<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackData")
            .field("params", &self.params)
            .field("context", &self.completion.context)
            .field("done", &self.outcome.is_some())
            .field("is_error", &self.is_error())
            .finish()
    }
}

impl<P, T> CallbackData<P, T> {
    /// Create a carrier for a new request
    pub const fn new(params: P, completion: Completion<T>) -> Self {
        Self {
            params,
            completion,
            outcome: None,
        }
    }

    /// Request parameters
    pub const fn params(&self) -> &P {
        &self.params
    }

    /// Context of the caller
    pub const fn context(&self) -> ContextId {
        self.completion.context
    }

    /// Store the operation result
    pub fn set_result(&mut self, value: T) {
        self.outcome = Some(Ok(value));
    }

    /// Store the operation failure
    pub fn set_error(&mut self, error: SeError) {
        self.outcome = Some(Err(error));
    }

    /// Whether a failure has been stored
    pub const fn is_error(&self) -> bool {
        matches!(self.outcome, Some(Err(_)))
    }

    /// Name of the stored error category
    pub fn error_name(&self) -> Option<&'static str> {
        match &self.outcome {
            Some(Err(error)) => Some(error.name()),
            _ => None,
        }
    }

    /// Message of the stored error
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Some(Err(error)) => Some(error.message()),
            _ => None,
        }
    }

    /// Deliver the outcome to the caller, consuming the carrier
    ///
    /// Must run on the main loop. Exactly one callback fires, or none when
    /// the caller's context is no longer alive.
    pub fn complete(self, liveness: &dyn ContextLiveness) -> Delivery {
        let Self {
            completion,
            outcome,
            ..
        } = self;

        if !liveness.is_alive(completion.context) {
            debug!(context = %completion.context, "Context was closed, dropping completion");
            return Delivery::Dropped;
        }

        match outcome {
            Some(Ok(value)) => {
                trace!(context = %completion.context, "Invoking success callback");
                (completion.on_success)(value);
                Delivery::Success
            }
            Some(Err(error)) => {
                trace!(context = %completion.context, %error, "Invoking error callback");
                (completion.on_error)(error);
                Delivery::Error
            }
            None => {
                (completion.on_error)(SeError::unknown("Operation produced no result"));
                Delivery::Error
            }
        }
    }
}

/// Parameters of a reader enumeration
#[derive(Debug, Clone, Copy, Default)]
pub struct GetReadersParams;

/// Parameters of a session open
#[derive(Debug, Clone, Copy)]
pub struct OpenSessionParams {
    /// Reader to open the session on
    pub reader: ReaderId,
}

/// Parameters of a channel open
#[derive(Debug, Clone)]
pub struct OpenChannelParams {
    /// Session to open the channel on
    pub session: SessionId,
    /// Application identifier to select
    pub aid: Bytes,
    /// Open the basic channel rather than a logical one
    pub basic: bool,
}

/// Parameters of a command transmission
#[derive(Debug, Clone)]
pub struct TransmitParams {
    /// Channel to send on
    pub channel: ChannelId,
    /// Command APDU
    pub command: Bytes,
}

/// Carrier of [`SeService::get_readers`](crate::SeService::get_readers)
pub type GetReadersCallbackData = CallbackData<GetReadersParams, Vec<Reader>>;

/// Carrier of [`Reader::open_session`]
pub type OpenSessionCallbackData = CallbackData<OpenSessionParams, Session>;

/// Carrier of [`Session::open_channel`]
pub type OpenChannelCallbackData = CallbackData<OpenChannelParams, Channel>;

/// Carrier of [`Channel::transmit`]
pub type TransmitCallbackData = CallbackData<TransmitParams, Bytes>;
