//! ISO 7816-4 commands issued by the driver itself

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::PcscError;

/// Successful execution
pub(crate) const SW_OK: u16 = 0x9000;

/// Highest logical channel number addressable through CLA
pub(crate) const MAX_CHANNEL: u8 = 19;

const INS_SELECT: u8 = 0xA4;
const INS_MANAGE_CHANNEL: u8 = 0x70;
const INS_GET_RESPONSE: u8 = 0xC0;

/// Encode `channel` into a class byte
///
/// Channels 0 to 3 use the first interindustry encoding, 4 to 19 the
/// further interindustry one. The proprietary and chaining bits of `cla`
/// are kept, as is the secure messaging indication of either class.
pub(crate) const fn with_channel(cla: u8, channel: u8) -> u8 {
    let kept = cla & 0x90;
    if channel < 4 {
        kept | (cla & 0x0C) | channel
    } else {
        kept | 0x40 | (cla & 0x20) | ((channel - 4) & 0x0F)
    }
}

/// SELECT by DF name on `channel`
pub(crate) fn select(channel: u8, aid: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(6 + aid.len());
    buffer.put_u8(with_channel(0x00, channel));
    buffer.put_u8(INS_SELECT);
    buffer.put_u8(0x04);
    buffer.put_u8(0x00);
    buffer.put_u8(aid.len() as u8);
    buffer.put_slice(aid);
    buffer.put_u8(0x00);
    buffer.freeze()
}

/// MANAGE CHANNEL open, letting the card choose the channel number
pub(crate) fn manage_channel_open() -> Bytes {
    Bytes::from_static(&[0x00, INS_MANAGE_CHANNEL, 0x00, 0x00, 0x01])
}

/// MANAGE CHANNEL close for `channel`, sent on that channel
pub(crate) fn manage_channel_close(channel: u8) -> Bytes {
    Bytes::copy_from_slice(&[
        with_channel(0x00, channel),
        INS_MANAGE_CHANNEL,
        0x80,
        channel,
    ])
}

/// GET RESPONSE for the remaining `le` bytes, on the channel of `cla`
pub(crate) fn get_response(cla: u8, le: u8) -> Bytes {
    Bytes::copy_from_slice(&[cla & 0x7F, INS_GET_RESPONSE, 0x00, 0x00, le])
}

/// Split a response APDU into its data and status word
pub(crate) fn split(response: &[u8]) -> Result<(&[u8], u16), PcscError> {
    match response {
        [data @ .., sw1, sw2] => Ok((data, u16::from_be_bytes([*sw1, *sw2]))),
        _ => Err(PcscError::InvalidResponse(format!(
            "expected a status word, got {}",
            hex::encode(response)
        ))),
    }
}

/// Whether `sw` reports success, possibly with a warning
pub(crate) const fn is_success(sw: u16) -> bool {
    sw == SW_OK || matches!(sw >> 8, 0x62 | 0x63)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_class_encoding() {
        assert_eq!(with_channel(0x00, 0), 0x00);
        assert_eq!(with_channel(0x00, 3), 0x03);
        assert_eq!(with_channel(0x80, 2), 0x82);
        assert_eq!(with_channel(0x0C, 1), 0x0D);
        assert_eq!(with_channel(0x00, 4), 0x40);
        assert_eq!(with_channel(0x10, 19), 0x5F);
        assert_eq!(with_channel(0x03, 0), 0x00);
        assert_eq!(with_channel(0x60, 5), 0x61);
        assert_eq!(with_channel(0x70, 19), 0x7F);
    }

    #[test]
    fn test_select_command() {
        let aid = hex::decode("A000000151").unwrap();
        assert_eq!(hex::encode(select(0, &aid)), "00a4040005a00000015100");
        assert_eq!(hex::encode(select(5, &aid)), "41a4040005a00000015100");
    }

    #[test]
    fn test_manage_channel_commands() {
        assert_eq!(hex::encode(manage_channel_open()), "0070000001");
        assert_eq!(hex::encode(manage_channel_close(2)), "02708002");
        assert_eq!(hex::encode(get_response(0x81, 0x10)), "01c0000010");
    }

    #[test]
    fn test_split_response() {
        let (data, sw) = split(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(data, &[0x01, 0x02]);
        assert_eq!(sw, SW_OK);

        assert!(matches!(
            split(&[0x90]),
            Err(PcscError::InvalidResponse(_))
        ));
        assert!(is_success(0x6283));
        assert!(!is_success(0x6A82));
    }
}
