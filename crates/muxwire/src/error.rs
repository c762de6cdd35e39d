//! Error taxonomy for the transport core.
//!
//! Every caller-visible failure is a [`TransportError`]. Codec and
//! serialization layers have their own error types which convert into it at
//! the point where a pending request is resolved.

use std::io;

use crate::frame::{CodecError, Status};
use crate::serialization::SerializationError;

/// Terminal error delivered to a caller through its completion.
///
/// `Clone` because a single connection failure fans out to every request
/// pending on that connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be created, or a write/transport failure made the
    /// request undeliverable.
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The request frame did not reach the transport before the deadline.
    #[error("request {request_id} on {connection} not sent within {timeout_ms}ms")]
    RequestTimeout {
        connection: String,
        request_id: u64,
        timeout_ms: u64,
    },

    /// The request was written but no response arrived before the deadline.
    #[error("no response for request {request_id} on {connection} within {timeout_ms}ms")]
    ResponseTimeout {
        connection: String,
        request_id: u64,
        timeout_ms: u64,
    },

    /// The connection went away while the request was outstanding.
    #[error("connection {connection} inactive: {reason}")]
    ChannelInactive { connection: String, reason: String },

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// The peer does not speak this protocol at all.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Malformed or unsupported response, including wrapped transport faults.
    #[error("unknown response status {status}: {message}")]
    UnknownResponseStatus { status: u8, message: String },

    /// The peer answered with a non-ok status.
    #[error("remote returned {status:?}: {message}")]
    Remote { status: Status, message: String },

    #[error("connection pool exhausted ({max_size} connections in use)")]
    PoolExhausted { max_size: usize },

    #[error("connection pool closed")]
    PoolClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn connect_failed(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn inactive(connection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChannelInactive {
            connection: connection.into(),
            reason: reason.into(),
        }
    }

    /// Timeouts are the only failures a caller may sensibly retry on the
    /// same connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. } | Self::ResponseTimeout { .. })
    }

    /// Maps a codec failure on a connection to the error its pending
    /// requests are resolved with.
    pub fn from_codec(connection: &str, err: &CodecError) -> Self {
        match err {
            CodecError::UnknownProtocol { .. } => Self::UnknownProtocol(err.to_string()),
            CodecError::PayloadTooLarge { .. } => Self::UnknownResponseStatus {
                status: Status::BadResponse.as_byte(),
                message: err.to_string(),
            },
            CodecError::Io(e) => Self::inactive(connection, format!("transport error: {e}")),
        }
    }
}

impl From<SerializationError> for TransportError {
    fn from(err: SerializationError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Internal(format!("I/O error: {err}"))
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
