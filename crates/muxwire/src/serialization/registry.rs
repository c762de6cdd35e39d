use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use super::{
    JsonSerialization, MsgpackSerialization, ObjectOutput, Serialization, SerializationError,
};
use crate::frame::{Body, MAX_SERIALIZATION_ID};

/// Serialization backends keyed by wire id.
///
/// Also caches each backend's encoded null, which heartbeat frames carry as
/// their body.
pub struct SerializationRegistry {
    backends: HashMap<u8, Arc<dyn Serialization>>,
    null_payloads: DashMap<u8, Bytes>,
}

impl SerializationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            null_payloads: DashMap::new(),
        }
    }

    /// Registry with the JSON and MessagePack backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for backend in [
            Arc::new(MsgpackSerialization) as Arc<dyn Serialization>,
            Arc::new(JsonSerialization),
        ] {
            registry.backends.insert(backend.id(), backend);
        }
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn Serialization>) -> Result<(), SerializationError> {
        let id = backend.id();
        if id > MAX_SERIALIZATION_ID {
            return Err(SerializationError::InvalidId(id));
        }
        if self.backends.contains_key(&id) {
            return Err(SerializationError::Duplicate(id));
        }
        self.backends.insert(id, backend);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<&Arc<dyn Serialization>, SerializationError> {
        self.backends
            .get(&id)
            .ok_or(SerializationError::Unknown(id))
    }

    pub fn contains(&self, id: u8) -> bool {
        self.backends.contains_key(&id)
    }

    /// Encode a body with backend `id`.
    pub fn encode<F>(&self, id: u8, write: F) -> Result<Body, SerializationError>
    where
        F: FnOnce(&mut dyn ObjectOutput) -> Result<(), SerializationError>,
    {
        let backend = self.get(id)?;
        let mut buf = BytesMut::new();
        {
            let mut out = backend.serialize(&mut buf);
            write(out.as_mut())?;
            out.flush()?;
            out.close()?;
        }
        Ok(Body::detached(buf.freeze()))
    }

    /// The encoded null of backend `id`.
    ///
    /// Computed once per id; every call returns its own handle on the cached
    /// bytes, which the caller may release independently.
    pub fn null_payload(&self, id: u8) -> Result<Body, SerializationError> {
        if let Some(cached) = self.null_payloads.get(&id) {
            return Ok(Body::detached(cached.clone()));
        }
        let bytes = self
            .encode(id, |out| out.write_value(&serde_json::Value::Null))?
            .into_bytes();
        let cached = self.null_payloads.entry(id).or_insert(bytes).clone();
        Ok(Body::detached(cached))
    }

    /// Whether `body` is exactly the encoded null of backend `id`.
    pub fn is_null_payload(&self, id: u8, body: &[u8]) -> bool {
        self.null_payload(id)
            .map(|null| null.as_ref() == body)
            .unwrap_or(false)
    }
}

impl Default for SerializationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for SerializationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.backends.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("SerializationRegistry")
            .field("ids", &ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{JSON_ID, MSGPACK_ID};

    #[test]
    fn null_payloads_per_backend() {
        let registry = SerializationRegistry::with_defaults();
        assert_eq!(registry.null_payload(JSON_ID).unwrap().as_ref(), b"null\n");
        assert_eq!(registry.null_payload(MSGPACK_ID).unwrap().as_ref(), &[0xc0]);
        assert!(registry.is_null_payload(JSON_ID, b"null\n"));
        assert!(!registry.is_null_payload(JSON_ID, b"\"null\"\n"));
        assert!(!registry.is_null_payload(9, b"null\n"));
    }

    #[test]
    fn null_payload_handles_are_independent() {
        let registry = SerializationRegistry::with_defaults();
        let first = registry.null_payload(MSGPACK_ID).unwrap();
        let second = registry.null_payload(MSGPACK_ID).unwrap();
        first.release();
        assert_eq!(second.as_ref(), &[0xc0]);
        assert_eq!(registry.null_payload(MSGPACK_ID).unwrap().as_ref(), &[0xc0]);
    }

    #[test]
    fn unknown_and_duplicate_ids() {
        let mut registry = SerializationRegistry::with_defaults();
        assert!(matches!(
            registry.get(17),
            Err(SerializationError::Unknown(17))
        ));
        assert_eq!(
            registry.register(Arc::new(JsonSerialization)),
            Err(SerializationError::Duplicate(JSON_ID))
        );

        let mut empty = SerializationRegistry::new();
        empty.register(Arc::new(JsonSerialization)).unwrap();
        assert!(empty.contains(JSON_ID));
        assert!(!empty.contains(MSGPACK_ID));
    }

    #[test]
    fn encode_wraps_the_writer() {
        let registry = SerializationRegistry::with_defaults();
        let body = registry
            .encode(JSON_ID, |out| {
                out.write_utf("a")?;
                out.write_i32(2)
            })
            .unwrap();
        assert_eq!(body.as_ref(), b"\"a\"\n2\n");
        assert!(!body.is_tracked());
    }
}
