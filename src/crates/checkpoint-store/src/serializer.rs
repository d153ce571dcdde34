//! Encoding of typed channel values into write payloads
//!
//! The store itself only moves bytes. A task that writes a structured value
//! picks a serializer, and the serializer's tag is stored as the write's `type`
//! and carried onto the blob at commit. Readers decode through
//! [`SerializerProtocol::decode_tagged`], which refuses payloads produced by a
//! different serializer instead of misreading them.

use crate::error::{Result, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Protocol for turning channel values into tagged payloads and back
pub trait SerializerProtocol: Send + Sync {
    /// Tag recorded as the `type` of writes and blobs produced by this serializer
    fn type_tag(&self) -> &'static str;

    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;

    /// Decode a payload stored under `kind`
    ///
    /// Fails with [`StoreError::TypeMismatch`] when `kind` is not this
    /// serializer's tag.
    fn decode_tagged<T: DeserializeOwned>(&self, kind: &str, data: &[u8]) -> Result<T> {
        if kind != self.type_tag() {
            return Err(StoreError::TypeMismatch {
                expected: self.type_tag().to_string(),
                found: kind.to_string(),
            });
        }
        self.loads(data)
    }
}

/// Human-readable view of a payload, if its tag is self-describing
///
/// Only JSON payloads can be decoded without knowing the Rust type. Anything
/// else (bincode, raw image bytes) yields `None`, as does a JSON-tagged
/// payload that fails to parse.
pub fn preview(kind: &str, data: &[u8]) -> Option<Value> {
    match kind {
        JsonSerializer::TYPE_TAG => serde_json::from_slice(data).ok(),
        _ => None,
    }
}

/// JSON serializer (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const TYPE_TAG: &'static str = "json";
}

impl SerializerProtocol for JsonSerializer {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(StoreError::from)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(StoreError::from)
    }
}

/// Compact binary serializer for large numeric channel values
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub const TYPE_TAG: &'static str = "bincode";
}

impl SerializerProtocol for BincodeSerializer {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(StoreError::from)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        bincode::deserialize(data).map_err(StoreError::from)
    }
}
