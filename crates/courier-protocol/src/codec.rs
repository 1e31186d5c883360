//! Codec for encoding and decoding Courier events.
//!
//! Frames are MessagePack with a 4-byte big-endian length prefix. The codec
//! is generic over the event type so both directions share one framing
//! implementation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (1 MiB). Chat events are small; anything larger is a
/// misbehaving client.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode an event to a length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode one event from a complete frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total = LENGTH_PREFIX_SIZE + length;
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total])?)
}

/// Try to decode one event from a read buffer, advancing it on success.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded, `Ok(None)` if
/// more data is needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);

    Ok(Some(rmp_serde::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, PresenceStatus, ServerEvent};

    #[test]
    fn test_encode_decode_roundtrip() {
        let event = ClientEvent::UserJoin {
            user_id: "u1".into(),
        };

        let frame = encode(&event).unwrap();
        let decoded: ClientEvent = decode(&frame).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_from_partial_buffer() {
        let event = ServerEvent::user_status("u1", PresenceStatus::Offline);
        let frame = encode(&event).unwrap();

        let mut buf = BytesMut::new();
        // Feed the frame one half at a time.
        let (a, b) = frame.split_at(frame.len() / 2);

        buf.extend_from_slice(a);
        assert!(decode_from::<ServerEvent>(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b);
        let decoded = decode_from::<ServerEvent>(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, event);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_from_coalesced_frames() {
        let a = ClientEvent::ConversationJoin {
            conversation_id: "c1".into(),
        };
        let b = ClientEvent::ConversationLeave {
            conversation_id: "c1".into(),
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&a).unwrap());
        buf.extend_from_slice(&encode(&b).unwrap());

        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(a));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(b));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            decode_from::<ClientEvent>(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1, 0xc1]);

        assert!(decode_from::<ClientEvent>(&mut buf).is_err());
    }
}
