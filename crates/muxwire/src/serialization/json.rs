//! Newline-delimited JSON backend.
//!
//! Each written value is one JSON document followed by `\n`. Byte arrays are
//! carried as base64 strings.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{JSON_ID, ObjectInput, ObjectOutput, RemoteError, Serialization, SerializationError};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerialization;

impl Serialization for JsonSerialization {
    fn id(&self) -> u8 {
        JSON_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "text/json"
    }

    fn serialize<'a>(&self, sink: &'a mut BytesMut) -> Box<dyn ObjectOutput + 'a> {
        Box::new(JsonOutput { sink })
    }

    fn deserialize(&self, source: Bytes) -> Box<dyn ObjectInput> {
        Box::new(JsonInput {
            data: source,
            pos: 0,
        })
    }
}

struct JsonOutput<'a> {
    sink: &'a mut BytesMut,
}

impl JsonOutput<'_> {
    fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SerializationError> {
        serde_json::to_writer((&mut *self.sink).writer(), value)
            .map_err(|e| SerializationError::Encode(e.to_string()))?;
        self.sink.put_u8(b'\n');
        Ok(())
    }
}

impl ObjectOutput for JsonOutput<'_> {
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
        self.put(&STANDARD.encode(value))
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

struct JsonInput {
    data: Bytes,
    pos: usize,
}

impl JsonInput {
    fn next<T: DeserializeOwned>(&mut self) -> Result<T, SerializationError> {
        if self.is_exhausted() {
            return Err(SerializationError::EndOfStream);
        }
        let mut stream =
            serde_json::Deserializer::from_slice(&self.data[self.pos..]).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => {
                self.pos += stream.byte_offset();
                Ok(value)
            }
            Some(Err(e)) if e.is_eof() => Err(SerializationError::EndOfStream),
            Some(Err(e)) if e.is_data() => Err(SerializationError::TypeMismatch(e.to_string())),
            Some(Err(e)) => Err(SerializationError::Decode(e.to_string())),
            None => Err(SerializationError::EndOfStream),
        }
    }
}

impl ObjectInput for JsonInput {
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
        let encoded: String = self.next()?;
        STANDARD
            .decode(encoded)
            .map_err(|e| SerializationError::Decode(e.to_string()))
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
        self.data[self.pos..].iter().all(u8::is_ascii_whitespace)
    }

    fn close(self: Box<Self>) -> Result<(), SerializationError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_newline_delimited() {
        let mut buf = BytesMut::new();
        {
            let mut out = JsonSerialization.serialize(&mut buf);
            out.write_u8(1).unwrap();
            out.write_utf("ok").unwrap();
            out.write_bytes(b"hi").unwrap();
            out.close().unwrap();
        }
        assert_eq!(&buf[..], b"1\n\"ok\"\n\"aGk=\"\n");
    }

    #[test]
    fn truncated_document_is_end_of_stream() {
        let mut input = JsonSerialization.deserialize(Bytes::from_static(b"{\"a\": 1"));
        assert_eq!(
            input.read_value().unwrap_err(),
            SerializationError::EndOfStream
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let mut input = JsonSerialization.deserialize(Bytes::from_static(b"@@@"));
        assert!(matches!(
            input.read_value(),
            Err(SerializationError::Decode(_))
        ));
    }
}
