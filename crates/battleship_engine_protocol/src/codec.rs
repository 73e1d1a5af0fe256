use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::PROTOCOL_VERSION;

/// Payload bytes above this size are refused rather than framed; matches the
/// 16-bit length prefix used on the wire.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

const HEADER_LEN: usize = 3; // protocol version (1 byte) + payload length (2 bytes, big-endian)

/// Encodes/decodes a protobuf envelope type as a length-prefixed frame over
/// any ordered byte stream. One `tokio_util::codec::Framed` instance of this
/// type wraps one direction of a connection.
#[derive(Debug)]
pub struct EnvelopeCodec<T> {
    _envelope: PhantomData<T>,
}

impl<T> Default for EnvelopeCodec<T> {
    fn default() -> Self {
        EnvelopeCodec {
            _envelope: PhantomData,
        }
    }
}

impl<T> Clone for EnvelopeCodec<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T: Message + Default> Decoder for EnvelopeCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = src[0];
        let payload_len = u16::from_be_bytes([src[1], src[2]]) as usize;

        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        if version != PROTOCOL_VERSION {
            return Err(FrameError::Malformed(format!(
                "unsupported protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len);

        decode_payload(payload.freeze())
    }
}

impl<T: Message> Encoder<T> for EnvelopeCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = item.encoded_len();
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload_len, MAX_FRAME_PAYLOAD));
        }

        dst.reserve(HEADER_LEN + payload_len);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u16(payload_len as u16);
        item.encode(dst)
            .expect("encoding into a reserved BytesMut is infallible");

        Ok(())
    }
}

/// Encodes a single envelope to its raw protobuf bytes, with no frame
/// header. For use against a socket abstraction that already preserves
/// message boundaries (e.g. one QUIC datagram, one WebSocket frame).
pub fn encode_payload<T: Message>(item: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(item.encoded_len());
    item.encode(&mut buf)
        .expect("encoding into a reserved BytesMut is infallible");
    buf.freeze()
}

/// Decodes a single envelope from raw protobuf bytes. Unknown oneof field
/// numbers are silently skipped by prost, giving the "unknown tag -> log and
/// drop" tolerance the framing component requires without any extra code
/// here; only truncated/corrupt bytes produce an error.
pub fn decode_payload<T: Message + Default>(bytes: Bytes) -> Result<T, FrameError> {
    T::decode(bytes).map_err(|e| FrameError::Malformed(e.to_string()))
}
