//! Length-framed binary codec for the client wire protocol.
//!
//! Every frame on the wire is laid out big-endian as:
//!
//! ```text
//! [u32 outer_length][u32 message_id][i32 payload_length][payload bytes]
//! ```
//!
//! `outer_length` covers everything after itself, so it always equals
//! `8 + payload_length`. The encoder writes exactly the layout the decoder
//! reads; there is no separate length-prepending stage.

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Identifier selecting the handler for a frame.
pub type MessageId = u32;

/// Size of the outer length prefix.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Size of the inner header (`message_id` + `payload_length`).
pub const HEADER_LEN: usize = 8;

/// Hard upper bound for a single payload (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: MessageId,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame from raw payload bytes.
    pub fn new(message_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
        }
    }

    /// Serializes a protobuf message into a frame.
    pub fn from_message<M: prost::Message>(message_id: MessageId, message: &M) -> Self {
        Self {
            message_id,
            payload: Bytes::from(message.encode_to_vec()),
        }
    }

    /// Decodes the payload as a protobuf message.
    pub fn decode_payload<M: prost::Message + Default>(&self) -> Result<M, prost::DecodeError> {
        M::decode(self.payload.clone())
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        LENGTH_FIELD_LEN + HEADER_LEN + self.payload.len()
    }
}

/// Stream codec turning bytes into [`Frame`]s and back.
///
/// Decoding is re-entrant: the buffer is only consumed once a whole frame is
/// present, so the codec can be polled repeatedly on a growing buffer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Creates a codec with the given payload limit, clamped to [`MAX_FRAME_BYTES`].
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_FRAME_BYTES),
        }
    }

    /// The effective payload limit.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < LENGTH_FIELD_LEN + HEADER_LEN {
            return Ok(None);
        }

        // Peek at the headers without consuming; the buffer stays untouched
        // until the full frame has arrived.
        let outer_length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let message_id = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let payload_length = i32::from_be_bytes([src[8], src[9], src[10], src[11]]);

        if payload_length < 0 {
            return Err(CodecError::NegativeLength(payload_length));
        }
        let payload_length = payload_length as usize;
        if payload_length > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                length: payload_length,
                max: self.max_payload,
            });
        }
        if outer_length != HEADER_LEN + payload_length {
            return Err(CodecError::MalformedHeader(format!(
                "outer length {outer_length} does not match payload length {payload_length}"
            )));
        }

        let total = LENGTH_FIELD_LEN + outer_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN + HEADER_LEN);
        let payload = src.split_to(payload_length).freeze();
        Ok(Some(Frame {
            message_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload_length = frame.payload.len();
        if payload_length > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                length: payload_length,
                max: self.max_payload,
            });
        }

        dst.reserve(frame.wire_len());
        dst.put_u32((HEADER_LEN + payload_length) as u32);
        dst.put_u32(frame.message_id);
        dst.put_i32(payload_length as i32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
