//! Pluggable body serialization.
//!
//! A [`Serialization`] is identified on the wire by a 5-bit id carried in the
//! header's flags byte. Implementations hand out sequential writers
//! ([`ObjectOutput`]) and readers ([`ObjectInput`]); a reader signals the end
//! of its input with [`SerializationError::EndOfStream`], which callers can
//! tell apart from malformed data.
//!
//! Backends are looked up through an injected [`SerializationRegistry`] rather
//! than a process-wide table.

mod json;
mod msgpack;
mod registry;

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use json::JsonSerialization;
pub use msgpack::MsgpackSerialization;
pub use registry::SerializationRegistry;

/// Wire id of the MessagePack backend.
pub const MSGPACK_ID: u8 = 2;
/// Wire id of the JSON backend.
pub const JSON_ID: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializationError {
    /// The reader has no more values.
    #[error("end of stream")]
    EndOfStream,

    /// The next value exists but is not of the requested type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("no serialization registered for id {0}")]
    Unknown(u8),

    #[error("serialization id {0} does not fit in the header")]
    InvalidId(u8),

    #[error("serialization id {0} is already registered")]
    Duplicate(u8),
}

/// Error value carried in a response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A wire serialization format.
pub trait Serialization: Send + Sync {
    /// Id carried in bits 3-7 of the flags byte.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    /// Writer appending encoded values to `sink`.
    fn serialize<'a>(&self, sink: &'a mut BytesMut) -> Box<dyn ObjectOutput + 'a>;

    /// Reader over a complete encoded body.
    fn deserialize(&self, source: Bytes) -> Box<dyn ObjectInput>;
}

/// Sequential writer of encoded values.
pub trait ObjectOutput {
    fn write_u8(&mut self, value: u8) -> Result<(), SerializationError>;
    fn write_i32(&mut self, value: i32) -> Result<(), SerializationError>;
    fn write_utf(&mut self, value: &str) -> Result<(), SerializationError>;
    fn write_bytes(&mut self, value: &[u8]) -> Result<(), SerializationError>;
    fn write_value(&mut self, value: &serde_json::Value) -> Result<(), SerializationError>;
    fn write_map(&mut self, value: &HashMap<String, String>) -> Result<(), SerializationError>;
    fn write_error(&mut self, value: &RemoteError) -> Result<(), SerializationError>;
    fn flush(&mut self) -> Result<(), SerializationError>;
    fn close(self: Box<Self>) -> Result<(), SerializationError>;
}

/// Sequential reader of encoded values.
pub trait ObjectInput: Send {
    fn read_u8(&mut self) -> Result<u8, SerializationError>;
    fn read_i32(&mut self) -> Result<i32, SerializationError>;
    fn read_utf(&mut self) -> Result<String, SerializationError>;
    fn read_bytes(&mut self) -> Result<Vec<u8>, SerializationError>;
    fn read_value(&mut self) -> Result<serde_json::Value, SerializationError>;
    fn read_map(&mut self) -> Result<HashMap<String, String>, SerializationError>;
    fn read_error(&mut self) -> Result<RemoteError, SerializationError>;
    /// True once every value has been read.
    fn is_exhausted(&self) -> bool;
    fn close(self: Box<Self>) -> Result<(), SerializationError>;
}

impl<'a> dyn ObjectOutput + 'a {
    /// Write any serde value as a generic value.
    pub fn write_object<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializationError> {
        let value =
            serde_json::to_value(value).map_err(|e| SerializationError::Encode(e.to_string()))?;
        self.write_value(&value)
    }
}

impl<'a> dyn ObjectInput + 'a {
    /// Read the next generic value into `T`.
    pub fn read_object<T: DeserializeOwned>(&mut self) -> Result<T, SerializationError> {
        let value = self.read_value()?;
        serde_json::from_value(value).map_err(|e| SerializationError::TypeMismatch(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backends() -> Vec<Box<dyn Serialization>> {
        vec![Box::new(JsonSerialization), Box::new(MsgpackSerialization)]
    }

    #[test]
    fn every_backend_reads_back_what_it_wrote() {
        for backend in backends() {
            let mut buf = BytesMut::new();
            {
                let mut out = backend.serialize(&mut buf);
                out.write_u8(3).unwrap();
                out.write_i32(-7).unwrap();
                out.write_utf("héllo").unwrap();
                out.write_bytes(&[0, 1, 255]).unwrap();
                out.write_value(&json!({"a": [1, 2], "b": null}))
                    .unwrap();
                out.write_map(&HashMap::from([("k".to_string(), "v".to_string())]))
                    .unwrap();
                out.write_error(&RemoteError::new("Boom", "it broke"))
                    .unwrap();
                out.flush().unwrap();
                out.close().unwrap();
            }

            let mut input = backend.deserialize(buf.freeze());
            let name = backend.name();
            assert_eq!(input.read_u8().unwrap(), 3, "{name}");
            assert_eq!(input.read_i32().unwrap(), -7, "{name}");
            assert_eq!(input.read_utf().unwrap(), "héllo", "{name}");
            assert_eq!(input.read_bytes().unwrap(), vec![0, 1, 255], "{name}");
            assert_eq!(
                input.read_value().unwrap(),
                json!({"a": [1, 2], "b": null}),
                "{name}"
            );
            assert_eq!(input.read_map().unwrap()["k"], "v", "{name}");
            assert_eq!(
                input.read_error().unwrap(),
                RemoteError::new("Boom", "it broke"),
                "{name}"
            );
            assert!(input.is_exhausted(), "{name}");
            assert_eq!(
                input.read_u8().unwrap_err(),
                SerializationError::EndOfStream,
                "{name}"
            );
            input.close().unwrap();
        }
    }

    #[test]
    fn type_mismatch_is_not_end_of_stream() {
        for backend in backends() {
            let mut buf = BytesMut::new();
            {
                let mut out = backend.serialize(&mut buf);
                out.write_utf("not a number").unwrap();
                out.close().unwrap();
            }
            let mut input = backend.deserialize(buf.freeze());
            let err = input.read_i32().unwrap_err();
            assert!(
                matches!(err, SerializationError::TypeMismatch(_)),
                "{}: {err:?}",
                backend.name()
            );
        }
    }

    #[test]
    fn typed_objects_go_through_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        for backend in backends() {
            let mut buf = BytesMut::new();
            {
                let mut out = backend.serialize(&mut buf);
                out.write_object(&Point { x: 1, y: -2 }).unwrap();
                out.close().unwrap();
            }
            let mut input = backend.deserialize(buf.freeze());
            let point: Point = input.read_object().unwrap();
            assert_eq!(point, Point { x: 1, y: -2 });
        }
    }
}
