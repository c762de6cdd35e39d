//! Encoding of the result carried by an ok response.
//!
//! Body layout: one kind byte, then the value or the remote error (nothing for
//! null), then a string map when the kind says attachments follow.

use std::collections::HashMap;

use serde_json::Value;

use crate::frame::Body;
use crate::serialization::{
    ObjectInput, ObjectOutput, RemoteError, SerializationError, SerializationRegistry,
};

/// Kind byte values.
pub mod kind {
    pub const ERROR: u8 = 0;
    pub const VALUE: u8 = 1;
    pub const NULL: u8 = 2;
    /// Added to the base kind when an attachment map follows.
    pub const WITH_ATTACHMENTS: u8 = 3;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Value),
    Null,
    Error(RemoteError),
}

/// Result of a remote invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResult {
    pub outcome: Outcome,
    pub attachments: HashMap<String, String>,
}

impl RpcResult {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            attachments: HashMap::new(),
        }
    }

    pub fn value(value: Value) -> Self {
        if value.is_null() {
            return Self::null();
        }
        Self::new(Outcome::Value(value))
    }

    pub fn null() -> Self {
        Self::new(Outcome::Null)
    }

    pub fn error(error: RemoteError) -> Self {
        Self::new(Outcome::Error(error))
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// The value, `Null` for a null result, or the remote error.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.outcome {
            Outcome::Value(v) => Ok(v),
            Outcome::Null => Ok(Value::Null),
            Outcome::Error(e) => Err(e),
        }
    }

    fn kind(&self) -> u8 {
        let base = match self.outcome {
            Outcome::Error(_) => kind::ERROR,
            Outcome::Value(_) => kind::VALUE,
            Outcome::Null => kind::NULL,
        };
        if self.attachments.is_empty() {
            base
        } else {
            base + kind::WITH_ATTACHMENTS
        }
    }

    pub fn encode(&self, out: &mut dyn ObjectOutput) -> Result<(), SerializationError> {
        out.write_u8(self.kind())?;
        match &self.outcome {
            Outcome::Value(v) => out.write_value(v)?,
            Outcome::Error(e) => out.write_error(e)?,
            Outcome::Null => {}
        }
        if !self.attachments.is_empty() {
            out.write_map(&self.attachments)?;
        }
        Ok(())
    }

    pub fn decode(input: &mut dyn ObjectInput) -> Result<Self, SerializationError> {
        let tag = input.read_u8()?;
        if tag >= 2 * kind::WITH_ATTACHMENTS {
            return Err(SerializationError::Decode(format!(
                "unknown result kind {tag}"
            )));
        }
        let outcome = match tag % kind::WITH_ATTACHMENTS {
            kind::ERROR => Outcome::Error(input.read_error()?),
            kind::VALUE => Outcome::Value(input.read_value()?),
            _ => Outcome::Null,
        };
        let attachments = if tag >= kind::WITH_ATTACHMENTS {
            input.read_map()?
        } else {
            HashMap::new()
        };
        Ok(Self {
            outcome,
            attachments,
        })
    }

    /// Encode as a complete response body with backend `serialization_id`.
    pub fn to_body(
        &self,
        registry: &SerializationRegistry,
        serialization_id: u8,
    ) -> Result<Body, SerializationError> {
        registry.encode(serialization_id, |out| self.encode(out))
    }

    /// Decode a complete response body.
    pub fn from_body(
        registry: &SerializationRegistry,
        serialization_id: u8,
        body: Body,
    ) -> Result<Self, SerializationError> {
        let backend = registry.get(serialization_id)?;
        let mut input = backend.deserialize(body.into_bytes());
        let result = Self::decode(input.as_mut())?;
        input.close()?;
        Ok(result)
    }
}
