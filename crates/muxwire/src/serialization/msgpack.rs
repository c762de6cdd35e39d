//! MessagePack backend using `rmp-serde`.
//!
//! Values are written back to back with no separator. Structs are encoded as
//! maps (`write_named`) so peers in other languages see field names. Byte
//! arrays use the native `bin` family.

use std::collections::HashMap;
use std::io::{self, Cursor};

use bytes::{BufMut, Bytes, BytesMut};
use rmp::decode::ValueReadError;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    MSGPACK_ID, ObjectInput, ObjectOutput, RemoteError, Serialization, SerializationError,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackSerialization;

impl Serialization for MsgpackSerialization {
    fn id(&self) -> u8 {
        MSGPACK_ID
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn serialize<'a>(&self, sink: &'a mut BytesMut) -> Box<dyn ObjectOutput + 'a> {
        Box::new(MsgpackOutput { sink })
    }

    fn deserialize(&self, source: Bytes) -> Box<dyn ObjectInput> {
        Box::new(MsgpackInput {
            data: source,
            pos: 0,
        })
    }
}

struct MsgpackOutput<'a> {
    sink: &'a mut BytesMut,
}

impl MsgpackOutput<'_> {
    fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SerializationError> {
        let mut writer = (&mut *self.sink).writer();
        rmp_serde::encode::write_named(&mut writer, value)
            .map_err(|e| SerializationError::Encode(e.to_string()))
    }
}

impl ObjectOutput for MsgpackOutput<'_> {
    fn write_u8(&mut self, value: u8) -> Result<(), SerializationError> {
        self.put(&value)
    }

    fn write_i32(&mut self, value: i32) -> Result<(), SerializationError> {
        self.put(&value)
    }

    fn write_utf(&mut self, value: &str) -> Result<(), SerializationError> {
        self.put(value)
    }

    fn write_bytes(&mut self, value: &[u8]) -> Result<(), SerializationError> {
        let mut writer = (&mut *self.sink).writer();
        rmp::encode::write_bin(&mut writer, value)
            .map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn write_value(&mut self, value: &serde_json::Value) -> Result<(), SerializationError> {
        self.put(value)
    }

    fn write_map(&mut self, value: &HashMap<String, String>) -> Result<(), SerializationError> {
        self.put(value)
    }

    fn write_error(&mut self, value: &RemoteError) -> Result<(), SerializationError> {
        self.put(value)
    }

    fn flush(&mut self) -> Result<(), SerializationError> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), SerializationError> {
        Ok(())
    }
}

struct MsgpackInput {
    data: Bytes,
    pos: usize,
}

fn is_eof(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

fn classify(err: rmp_serde::decode::Error) -> SerializationError {
    use rmp_serde::decode::Error;
    match &err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) if is_eof(e) => {
            SerializationError::EndOfStream
        }
        Error::TypeMismatch(_) | Error::OutOfRange | Error::Syntax(_) => {
            SerializationError::TypeMismatch(err.to_string())
        }
        _ => SerializationError::Decode(err.to_string()),
    }
}

impl MsgpackInput {
    fn next<T: DeserializeOwned>(&mut self) -> Result<T, SerializationError> {
        if self.is_exhausted() {
            return Err(SerializationError::EndOfStream);
        }
        let mut cursor = Cursor::new(&self.data[self.pos..]);
        let value = rmp_serde::from_read(&mut cursor).map_err(classify)?;
        self.pos += cursor.position() as usize;
        Ok(value)
    }
}

impl ObjectInput for MsgpackInput {
    fn read_u8(&mut self) -> Result<u8, SerializationError> {
        self.next()
    }

    fn read_i32(&mut self) -> Result<i32, SerializationError> {
        self.next()
    }

    fn read_utf(&mut self) -> Result<String, SerializationError> {
        self.next()
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, SerializationError> {
        if self.is_exhausted() {
            return Err(SerializationError::EndOfStream);
        }
        let mut cursor = Cursor::new(&self.data[self.pos..]);
        let len = match rmp::decode::read_bin_len(&mut cursor) {
            Ok(len) => len as usize,
            Err(ValueReadError::TypeMismatch(marker)) => {
                return Err(SerializationError::TypeMismatch(format!(
                    "expected bin, found {marker:?}"
                )));
            }
            Err(
                ValueReadError::InvalidMarkerRead(e) | ValueReadError::InvalidDataRead(e),
            ) if is_eof(&e) => return Err(SerializationError::EndOfStream),
            Err(e) => return Err(SerializationError::Decode(e.to_string())),
        };
        let start = self.pos + cursor.position() as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(SerializationError::EndOfStream);
        }
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn read_value(&mut self) -> Result<serde_json::Value, SerializationError> {
        self.next()
    }

    fn read_map(&mut self) -> Result<HashMap<String, String>, SerializationError> {
        self.next()
    }

    fn read_error(&mut self) -> Result<RemoteError, SerializationError> {
        self.next()
    }

    fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn close(self: Box<Self>) -> Result<(), SerializationError> {
        Ok(())
    }
}
