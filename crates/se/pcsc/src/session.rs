//! Card connection backing a native session

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use nexum_se_core::{NativeChannel, NativeError, NativeSession};
use parking_lot::Mutex;
use pcsc::{Card, Disposition};
use tracing::{debug, trace, warn};

use crate::apdu;
use crate::channel::PcscChannel;
use crate::error::PcscError;

/// Channels opened from one session, by channel number
#[derive(Debug, Default)]
struct ChannelTable {
    open: BTreeMap<u8, Weak<PcscChannel>>,
}

/// A connected card
pub(crate) struct PcscSession {
    me: Weak<Self>,
    reader_name: String,
    card: Mutex<Option<Card>>,
    atr: Bytes,
    channels: Mutex<ChannelTable>,
    closed: AtomicBool,
}

impl fmt::Debug for PcscSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscSession")
            .field("reader_name", &self.reader_name)
            .field("atr", &hex::encode(&self.atr))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl PcscSession {
    pub(crate) fn new(reader_name: String, card: Card, atr: Bytes) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            reader_name,
            card: Mutex::new(Some(card)),
            atr,
            channels: Mutex::new(ChannelTable::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Send `command` and collect the complete response
    pub(crate) fn exchange(&self, command: &[u8]) -> Result<Bytes, PcscError> {
        let guard = self.card.lock();
        let card = guard.as_ref().ok_or(PcscError::SessionClosed)?;
        complete_response(command, |apdu| transmit_raw(card, apdu))
    }

    /// Forget a closed channel so its number can be reused
    pub(crate) fn release(&self, number: u8) {
        self.channels.lock().open.remove(&number);
    }

    fn ensure_open(&self) -> Result<(), PcscError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PcscError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn select(&self, number: u8, aid: &[u8]) -> Result<Bytes, PcscError> {
        let response = self.exchange(&apdu::select(number, aid))?;
        let (_, sw) = apdu::split(&response)?;
        if apdu::is_success(sw) {
            Ok(response)
        } else {
            Err(PcscError::Status {
                command: "SELECT",
                sw,
            })
        }
    }

    fn track(&self, number: u8, select_response: Bytes) -> Arc<PcscChannel> {
        let channel = Arc::new(PcscChannel::new(self.me.clone(), number, select_response));
        self.channels
            .lock()
            .open
            .insert(number, Arc::downgrade(&channel));
        channel
    }

    fn open_logical(&self, aid: &[u8]) -> Result<Arc<PcscChannel>, PcscError> {
        self.ensure_open()?;

        let response = self.exchange(&apdu::manage_channel_open())?;
        let number = match apdu::split(&response)? {
            ([number], apdu::SW_OK) if (1..=apdu::MAX_CHANNEL).contains(number) => *number,
            (_, apdu::SW_OK) => {
                return Err(PcscError::InvalidResponse(format!(
                    "unexpected MANAGE CHANNEL response {}",
                    hex::encode(&response)
                )));
            }
            (_, sw) => {
                return Err(PcscError::Status {
                    command: "MANAGE CHANNEL",
                    sw,
                });
            }
        };

        match self.select(number, aid) {
            Ok(select_response) => {
                debug!(reader = %self.reader_name, number, "Opened logical channel");
                Ok(self.track(number, select_response))
            }
            Err(error) => {
                if let Err(close_error) = self.exchange(&apdu::manage_channel_close(number)) {
                    warn!(%close_error, number, "Failed to close unused logical channel");
                }
                Err(error)
            }
        }
    }

    fn open_basic(&self, aid: &[u8]) -> Result<Arc<PcscChannel>, PcscError> {
        self.ensure_open()?;

        // Reserve the slot before selecting so concurrent opens fail fast
        {
            let mut channels = self.channels.lock();
            if channels
                .open
                .get(&0)
                .and_then(Weak::upgrade)
                .is_some_and(|channel| !channel.is_closed())
            {
                return Err(PcscError::BasicChannelBusy);
            }
            channels.open.insert(0, Weak::new());
        }

        match self.select(0, aid) {
            Ok(select_response) => Ok(self.track(0, select_response)),
            Err(error) => {
                self.release(0);
                Err(error)
            }
        }
    }

    fn close_all_channels(&self) -> Result<(), PcscError> {
        let open: Vec<_> = {
            let mut channels = self.channels.lock();
            std::mem::take(&mut channels.open)
                .into_values()
                .filter_map(|channel| channel.upgrade())
                .collect()
        };

        let mut result = Ok(());
        for channel in open {
            if let Err(error) = channel.shut() {
                warn!(%error, number = channel.number(), "Failed to close channel");
                result = Err(error);
            }
        }
        result
    }
}

impl NativeSession for PcscSession {
    fn open_basic_channel(&self, aid: &[u8]) -> Result<Arc<dyn NativeChannel>, NativeError> {
        Ok(self.open_basic(aid)?)
    }

    fn open_logical_channel(&self, aid: &[u8]) -> Result<Arc<dyn NativeChannel>, NativeError> {
        Ok(self.open_logical(aid)?)
    }

    fn atr(&self) -> Result<Bytes, NativeError> {
        self.ensure_open()?;
        Ok(self.atr.clone())
    }

    fn close(&self) -> Result<(), NativeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channels = self.close_all_channels();
        if let Some(card) = self.card.lock().take()
            && let Err((_, error)) = card.disconnect(Disposition::LeaveCard)
        {
            warn!(%error, reader = %self.reader_name, "Failed to disconnect card");
        }
        debug!(reader = %self.reader_name, "Closed session");
        channels.map_err(Into::into)
    }

    fn close_channels(&self) -> Result<(), NativeError> {
        self.close_all_channels().map_err(Into::into)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for PcscSession {
    fn drop(&mut self) {
        if let Some(card) = self.card.get_mut().take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
    }
}

/// Most GET RESPONSE commands sent for one command
const MAX_CHAIN: usize = 10;

/// Run `command` through `transmit`, following up on the status word
///
/// `61xx` is followed by GET RESPONSE until the card is done, `6Cxx` on a
/// command without data is retried once with the corrected Le.
fn complete_response<F>(command: &[u8], mut transmit: F) -> Result<Bytes, PcscError>
where
    F: FnMut(&[u8]) -> Result<Bytes, PcscError>,
{
    let mut response = transmit(command)?;
    let (_, sw) = apdu::split(&response)?;
    if sw >> 8 == 0x6C && (4..=5).contains(&command.len()) {
        let mut retry = BytesMut::with_capacity(5);
        retry.put_slice(&command[..4]);
        retry.put_u8(sw as u8);
        response = transmit(&retry)?;
    }

    let mut collected = BytesMut::new();
    let mut chained = 0;
    loop {
        let (data, sw) = apdu::split(&response)?;
        if sw >> 8 != 0x61 {
            collected.put_slice(&response);
            return Ok(collected.freeze());
        }
        if chained == MAX_CHAIN {
            return Err(PcscError::InvalidResponse(format!(
                "card still has data after {MAX_CHAIN} GET RESPONSE commands"
            )));
        }
        chained += 1;
        collected.put_slice(data);
        response = transmit(&apdu::get_response(command[0], sw as u8))?;
    }
}

fn transmit_raw(card: &Card, command: &[u8]) -> Result<Bytes, PcscError> {
    let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
    trace!(command = %hex::encode(command), "Sending APDU");
    let response = card.transmit(command, &mut buffer)?;
    trace!(response = %hex::encode(response), "Received APDU");
    Ok(Bytes::copy_from_slice(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_response_chaining() {
        let mut sent = Vec::new();
        let response = complete_response(&[0x00, 0xCA, 0x00, 0x00], |apdu| {
            sent.push(hex::encode(apdu));
            Ok(Bytes::from(match sent.len() {
                1 => vec![0x01, 0x02, 0x61, 0x02],
                _ => vec![0x03, 0x04, 0x90, 0x00],
            }))
        })
        .unwrap();

        assert_eq!(hex::encode(response), "010203049000");
        assert_eq!(sent, ["00ca0000", "00c0000002"]);
    }

    #[test]
    fn test_wrong_length_is_retried_once() {
        let mut sent = Vec::new();
        let response = complete_response(&[0x00, 0xB0, 0x00, 0x00, 0x00], |apdu| {
            sent.push(hex::encode(apdu));
            Ok(Bytes::from(match sent.len() {
                1 => vec![0x6C, 0x01],
                _ => vec![0xAA, 0x90, 0x00],
            }))
        })
        .unwrap();

        assert_eq!(hex::encode(response), "aa9000");
        assert_eq!(sent, ["00b0000000", "00b0000001"]);
    }

    #[test]
    fn test_endless_chaining_is_cut_off() {
        let mut calls = 0;
        let result = complete_response(&[0x00, 0xCA, 0x00, 0x00], |_| {
            calls += 1;
            Ok(Bytes::from_static(&[0x00, 0x61, 0x01]))
        });

        assert!(matches!(result, Err(PcscError::InvalidResponse(_))));
        assert_eq!(calls, MAX_CHAIN + 1);
    }
}
