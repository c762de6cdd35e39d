//! Streaming frame codec.
//!
//! Uses LengthDelimitedCodec for framing: the length field sits at offset 12,
//! the length adjustment re-adds the header and nothing is skipped, so every
//! item the inner codec yields is one complete header+body.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{
    Body, BodyArena, Frame, FrameTiming, HEADER_SIZE, LENGTH_FIELD_OFFSET, MAGIC_BYTES,
    MAX_SERIALIZATION_ID, Status, flags,
};
use crate::serialization::SerializationRegistry;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The stream does not start with this protocol's magic.
    #[error("unknown protocol: expected magic dabb, found {found:02x?}")]
    UnknownProtocol { found: [u8; 2] },

    #[error("frame body of {len} bytes exceeds payload limit of {limit} bytes")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Largest body the 4-byte length field can describe.
pub const MAX_PAYLOAD_LIMIT: usize = u32::MAX as usize;

/// Codec that turns a byte stream into [`Frame`]s and back.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    payload_limit: usize,
    registry: Arc<SerializationRegistry>,
    arena: Arc<BodyArena>,
    /// First-byte instant of the frame currently being assembled.
    first_byte_at: Option<Instant>,
}

impl FrameCodec {
    pub fn new(
        registry: Arc<SerializationRegistry>,
        arena: Arc<BodyArena>,
        payload_limit: usize,
    ) -> Self {
        let payload_limit = payload_limit.min(MAX_PAYLOAD_LIMIT);
        Self {
            inner: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_offset(LENGTH_FIELD_OFFSET)
                .length_field_length(4)
                .length_adjustment(HEADER_SIZE as isize)
                .num_skip(0)
                .max_frame_length(payload_limit.saturating_add(HEADER_SIZE))
                .new_codec(),
            payload_limit,
            registry,
            arena,
            first_byte_at: None,
        }
    }

    pub fn payload_limit(&self) -> usize {
        self.payload_limit
    }

    fn check_header(&self, src: &BytesMut) -> Result<(), CodecError> {
        let magic_len = src.len().min(MAGIC_BYTES.len());
        if src[..magic_len] != MAGIC_BYTES[..magic_len] {
            let mut found = [0u8; 2];
            found[..magic_len].copy_from_slice(&src[..magic_len]);
            return Err(CodecError::UnknownProtocol { found });
        }

        if src.len() >= HEADER_SIZE {
            let len = (&src[LENGTH_FIELD_OFFSET..HEADER_SIZE]).get_u32() as usize;
            if len > self.payload_limit {
                return Err(CodecError::PayloadTooLarge {
                    len,
                    limit: self.payload_limit,
                });
            }
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let first_byte_at = *self.first_byte_at.get_or_insert_with(Instant::now);

        self.check_header(src)?;

        let Some(mut raw) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let completed_at = Instant::now();
        self.first_byte_at = None;

        let mut header = raw.split_to(HEADER_SIZE);
        header.advance(MAGIC_BYTES.len());
        let flag_bits = header.get_u8();
        let status_byte = header.get_u8();
        let request_id = header.get_u64();

        let is_request = flag_bits & flags::REQUEST != 0;
        let is_event = flag_bits & flags::EVENT != 0;
        let serialization_id = (flag_bits >> flags::SERIALIZATION_SHIFT) & MAX_SERIALIZATION_ID;
        let body = self.arena.adopt(raw.freeze());
        let is_heartbeat = is_event
            && (body.is_empty() || self.registry.is_null_payload(serialization_id, body.as_ref()));

        let frame = Frame {
            request_id,
            is_request,
            two_way: flag_bits & flags::TWO_WAY != 0,
            is_event,
            is_heartbeat,
            serialization_id,
            status: if is_request {
                Status::Ok
            } else {
                Status::from_byte(status_byte)
            },
            body,
            timing: Some(FrameTiming {
                first_byte_at,
                completed_at,
            }),
        };

        tracing::trace!(
            request_id,
            kind = frame.kind(),
            body_len = frame.body.len(),
            "Decoded frame"
        );
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.body.len();
        if len > self.payload_limit {
            return Err(CodecError::PayloadTooLarge {
                len,
                limit: self.payload_limit,
            });
        }

        let flag_bits = frame.flags();
        let status = if frame.is_request {
            0
        } else {
            frame.status.as_byte()
        };

        dst.reserve(HEADER_SIZE + len);
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(flag_bits);
        dst.put_u8(status);
        dst.put_u64(frame.request_id);
        dst.put_u32(len as u32);
        dst.put_slice(frame.body.as_bytes());

        tracing::trace!(
            request_id = frame.request_id,
            kind = frame.kind(),
            body_len = len,
            "Encoded frame"
        );
        frame.into_body().release();
        Ok(())
    }
}
