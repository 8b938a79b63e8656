//! Channel wrapper handed to callers

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{instrument, trace, warn};

use crate::arena::SlotKey;
use crate::callback::{Completion, TransmitCallbackData, TransmitParams};
use crate::error::SeError;
use crate::native::NativeChannel;
use crate::service::{ServiceShared, upgrade};

/// Handle of a channel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("channel#{_0}")]
pub struct ChannelId(pub(crate) SlotKey);

/// A basic or logical channel to an applet
///
/// Dropping the channel closes it. A channel stops working once its
/// session is closed or dropped.
pub struct Channel {
    service: Weak<ServiceShared>,
    id: ChannelId,
    basic: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("basic", &self.basic)
            .finish()
    }
}

impl Channel {
    pub(crate) const fn new(service: Weak<ServiceShared>, id: ChannelId, basic: bool) -> Self {
        Self { service, id, basic }
    }

    /// Slot of this channel
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether this is the basic channel
    pub const fn is_basic_channel(&self) -> bool {
        self.basic
    }

    /// Send `command` and deliver the response APDU through `completion`
    #[instrument(level = "trace", skip_all, fields(channel = %self.id))]
    pub fn transmit(&self, command: &[u8], completion: Completion<Bytes>) -> Result<(), SeError> {
        let service = upgrade(&self.service)?;
        let (token, _) = service.job_token();
        let carrier = TransmitCallbackData::new(
            TransmitParams {
                channel: self.id,
                command: Bytes::copy_from_slice(command),
            },
            completion,
        );

        let weak = self.service.clone();
        service
            .runner()
            .spawn("transmitting", token, carrier, move |params| {
                let native = usable(&weak, params.channel)?;
                trace!(command = %hex::encode(&params.command), "Sending APDU");
                let response = native
                    .transmit(&params.command)
                    .map_err(|e| SeError::from_native(&e, "transmitting"))?;
                trace!(response = %hex::encode(&response), "Received APDU");
                Ok(response)
            })
    }

    /// Response to the SELECT command that opened the channel
    pub fn select_response(&self) -> Result<Bytes, SeError> {
        self.native()?
            .select_response()
            .map_err(|e| SeError::unknown_native(&e, "getting select response"))
    }

    /// Close the channel
    ///
    /// Closing a channel that is already closed, or whose handle outlived a
    /// shutdown, does nothing.
    pub fn close(&self) -> Result<(), SeError> {
        let Ok(native) = self.native() else {
            return Ok(());
        };
        if native.is_closed() {
            return Ok(());
        }
        native
            .close()
            .map_err(|e| SeError::unknown_native(&e, "closing channel"))
    }

    /// Whether the channel is closed, directly or through its session
    pub fn is_closed(&self) -> bool {
        usable(&self.service, self.id).is_err()
    }

    fn native(&self) -> Result<Arc<dyn NativeChannel>, SeError> {
        let (channel, _) = upgrade(&self.service)?.resources().channel(self.id)?;
        Ok(channel)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let Some(native) = service.resources().remove_channel(self.id) else {
            return;
        };
        if !native.is_closed() {
            trace!(channel = %self.id, "Closing dropped channel");
            if let Err(error) = native.close() {
                warn!(channel = %self.id, %error, "Failed to close dropped channel");
            }
        }
    }
}

/// Resolve a channel whose session is still open
fn usable(service: &Weak<ServiceShared>, id: ChannelId) -> Result<Arc<dyn NativeChannel>, SeError> {
    let (channel, session) = upgrade(service)?.resources().channel(id)?;
    if session.is_closed() || channel.is_closed() {
        return Err(SeError::invalid_state("channel is closed"));
    }
    Ok(channel)
}
