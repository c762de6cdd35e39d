//! Wire frame model.
//!
//! Header layout, all integers big endian:
//! ```text
//! ┌─────────┬────────┬────────┬────────────┬─────────────┐
//! │ Magic   │ Flags  │ Status │ Request ID │ Body length │
//! │ 2 bytes │ 1 byte │ 1 byte │ 8 bytes    │ 4 bytes     │
//! └─────────┴────────┴────────┴────────────┴─────────────┘
//! ```
//!
//! Flags: bit0 request/response, bit1 two-way, bit2 event, bits3-7
//! serialization id. Status is only meaningful on responses.

mod body;
mod codec;

use std::time::{Duration, Instant};

pub use body::{Body, BodyArena};
pub use codec::{CodecError, FrameCodec};

pub const MAGIC: u16 = 0xdabb;
pub const MAGIC_BYTES: [u8; 2] = MAGIC.to_be_bytes();

pub const HEADER_SIZE: usize = 16;

/// Offset of the 4-byte body length field inside the header.
pub const LENGTH_FIELD_OFFSET: usize = 12;

/// Default upper bound for a single frame body (8 MiB).
pub const DEFAULT_PAYLOAD_LIMIT: usize = 8 * 1024 * 1024;

/// Largest serialization id representable in the flags byte.
pub const MAX_SERIALIZATION_ID: u8 = 0x1f;

/// Flag bits of the header's flags byte.
pub mod flags {
    pub const REQUEST: u8 = 0b0000_0001;
    pub const TWO_WAY: u8 = 0b0000_0010;
    pub const EVENT: u8 = 0b0000_0100;
    pub const SERIALIZATION_SHIFT: u8 = 3;
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    ClientTimeout,
    ServerTimeout,
    ChannelInactive,
    /// Request could not be serialized or was rejected as malformed.
    BadRequest,
    /// Response could not be serialized or deserialized.
    BadResponse,
    ServerError,
    ClientError,
    Unknown(u8),
}

impl Status {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            20 => Self::Ok,
            30 => Self::ClientTimeout,
            31 => Self::ServerTimeout,
            35 => Self::ChannelInactive,
            40 => Self::BadRequest,
            50 => Self::BadResponse,
            80 => Self::ServerError,
            90 => Self::ClientError,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Ok => 20,
            Self::ClientTimeout => 30,
            Self::ServerTimeout => 31,
            Self::ChannelInactive => 35,
            Self::BadRequest => 40,
            Self::BadResponse => 50,
            Self::ServerError => 80,
            Self::ClientError => 90,
            Self::Unknown(b) => *b,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Arrival timing stamped by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// When the first byte of the frame was seen (time to first byte).
    pub first_byte_at: Instant,
    /// When the last byte arrived and the frame was emitted.
    pub completed_at: Instant,
}

impl FrameTiming {
    /// Time spent receiving the frame from first byte to last.
    pub fn transfer(&self) -> Duration {
        self.completed_at.duration_since(self.first_byte_at)
    }
}

/// One complete protocol message.
///
/// Not `Clone`: the body has exactly one owner.
#[derive(Debug)]
pub struct Frame {
    pub request_id: u64,
    pub is_request: bool,
    pub two_way: bool,
    pub is_event: bool,
    /// Event frame carrying the serialization's encoded null.
    pub is_heartbeat: bool,
    pub serialization_id: u8,
    pub status: Status,
    pub body: Body,
    pub timing: Option<FrameTiming>,
}

impl Frame {
    fn new(request_id: u64, serialization_id: u8, body: Body) -> Self {
        Self {
            request_id,
            is_request: false,
            two_way: false,
            is_event: false,
            is_heartbeat: false,
            serialization_id: serialization_id & MAX_SERIALIZATION_ID,
            status: Status::Ok,
            body,
            timing: None,
        }
    }

    /// Two-way request expecting a correlated response.
    pub fn request(request_id: u64, serialization_id: u8, body: Body) -> Self {
        Self {
            is_request: true,
            two_way: true,
            ..Self::new(request_id, serialization_id, body)
        }
    }

    /// One-way request; the peer sends nothing back.
    pub fn oneway(request_id: u64, serialization_id: u8, body: Body) -> Self {
        Self {
            is_request: true,
            ..Self::new(request_id, serialization_id, body)
        }
    }

    /// One-way event notification.
    pub fn event(request_id: u64, serialization_id: u8, body: Body) -> Self {
        Self {
            is_request: true,
            is_event: true,
            ..Self::new(request_id, serialization_id, body)
        }
    }

    /// Liveness probe. `null_body` must be the serialization's null payload.
    pub fn heartbeat_request(request_id: u64, serialization_id: u8, null_body: Body) -> Self {
        Self {
            is_request: true,
            two_way: true,
            is_event: true,
            is_heartbeat: true,
            ..Self::new(request_id, serialization_id, null_body)
        }
    }

    /// Answer to a liveness probe, echoing its id.
    pub fn heartbeat_response(request_id: u64, serialization_id: u8, null_body: Body) -> Self {
        Self {
            is_event: true,
            is_heartbeat: true,
            ..Self::new(request_id, serialization_id, null_body)
        }
    }

    pub fn response(request_id: u64, serialization_id: u8, status: Status, body: Body) -> Self {
        Self {
            status,
            ..Self::new(request_id, serialization_id, body)
        }
    }

    pub fn flags(&self) -> u8 {
        let mut bits = self.serialization_id << flags::SERIALIZATION_SHIFT;
        if self.is_request {
            bits |= flags::REQUEST;
        }
        if self.two_way {
            bits |= flags::TWO_WAY;
        }
        if self.is_event {
            bits |= flags::EVENT;
        }
        bits
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Human-readable frame kind for logs.
    pub fn kind(&self) -> &'static str {
        match (self.is_request, self.is_heartbeat, self.is_event, self.two_way) {
            (true, true, _, _) => "heartbeat-request",
            (false, true, _, _) => "heartbeat-response",
            (true, false, true, _) => "event",
            (true, false, false, true) => "request",
            (true, false, false, false) => "oneway",
            (false, false, _, _) => "response",
        }
    }
}
