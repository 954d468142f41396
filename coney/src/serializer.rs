//! Pluggable message codecs.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializerError;

/// A codec between wire payloads and typed messages.
///
/// Implementations must be pure and thread-safe; the same serializer instance is
/// shared by every subscription of a consumer.
pub trait Serializer<T>: Send + Sync + 'static {
    /// The MIME type published alongside payloads produced by this serializer.
    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    /// Encodes a value into a byte payload.
    ///
    /// # Errors
    /// Returns [`SerializerError::Encode`] if the value cannot be represented.
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Decodes a byte payload into a value.
    ///
    /// # Errors
    /// Returns [`SerializerError::Decode`] on malformed payloads. Decode failures
    /// are per-message; the consumer routes them to the rejection handler.
    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}

/// The default codec: UTF-8 JSON payloads via [`serde_json`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned + Send,
{
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError::Encode(e.into()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(e.into()))
    }
}
