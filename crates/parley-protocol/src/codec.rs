//! Length-prefixed MessagePack codec for [`Frame`]s.
//!
//! Layout on the wire:
//! - 4 bytes: big-endian payload length
//! - N bytes: MessagePack-encoded frame (named fields)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

fn read_length(data: &[u8]) -> Result<usize, ProtocolError> {
    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode exactly one frame from the start of `data`.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let total_size = LENGTH_PREFIX_SIZE + read_length(data)?;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` while the buffer holds only part of a frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = read_length(buf)?;
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
    use crate::rpc::{Delivery, DeliveryEvent, ErrorCode, Request, Response};
    use crate::version::Version;
    use uuid::Uuid;

    #[test]
    fn test_request_and_delivery_survive_the_wire() {
        let conversation_id = Uuid::new_v4();
        let frames = vec![
            Frame::hello(Version::default()),
            Frame::request(
                1,
                Request::SendMessage {
                    sender: "alice".into(),
                    conversation_id,
                    payload: b"hi bob".to_vec(),
                },
            ),
            Frame::response(
                2,
                Response::Deliveries {
                    deliveries: vec![Delivery {
                        cursor: 9,
                        event: DeliveryEvent::Welcome {
                            conversation_id,
                            name: "team".into(),
                            members: vec!["alice".into(), "bob".into()],
                        },
                    }],
                },
            ),
            Frame::response(3, Response::error(ErrorCode::UnknownUser, "carol")),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            assert_eq!(decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Frame::ping()).unwrap();

        match decode(&encoded[..encoded.len() - 1]) {
            Err(ProtocolError::Incomplete(1)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
        assert!(matches!(decode(&encoded[..2]), Err(ProtocolError::Incomplete(2))));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_from(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode_across_chunks() {
        let first = encode(&Frame::request(
            1,
            Request::ListClients {
                username: "alice".into(),
            },
        ))
        .unwrap();
        let second = encode(&Frame::pong(Some(5))).unwrap();

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first);
        wire.extend_from_slice(&second);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..3]);
        assert!(decode_from(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[3..]);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap().frame_type(), crate::FrameType::Request);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), Frame::pong(Some(5)));
        assert!(buf.is_empty());
    }
}
