// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! This module provides the pluggable serializer seam between raw delivery
//! bodies and the typed messages handlers receive. The default is a JSON
//! codec over UTF-8 payloads, matching the `application/json` content type
//! the publisher stamps on outgoing messages.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Content type stamped on JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors produced by a [`Serializer`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SerializerError {
    /// The value could not be rendered to bytes
    #[error("failure to serialize payload: {0}")]
    SerializeError(String),

    /// The bytes could not be decoded into the target type
    #[error("failure to deserialize payload: {0}")]
    DeserializeError(String),
}

/// Byte-array to typed-value codec.
///
/// Implementations must be pure and thread-safe: the same serializer instance
/// is shared by every subscription of a consumer and by the publish helpers.
pub trait Serializer: Send + Sync + 'static {
    /// Content type advertised on published messages.
    fn content_type(&self) -> &'static str;

    /// Renders a value to a payload byte sequence.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Decodes a payload byte sequence into the target type.
    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, SerializerError>;
}

/// The default serializer: JSON text with UTF-8 byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|err| SerializerError::SerializeError(err.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, SerializerError> {
        serde_json::from_slice(payload)
            .map_err(|err| SerializerError::DeserializeError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Order {
        id: u64,
        sku: String,
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer;
        let order = Order {
            id: 42,
            sku: "ab-123".to_owned(),
        };

        let payload = serializer.serialize(&order).unwrap();
        let decoded: Order = serializer.deserialize(&payload).unwrap();

        assert_eq!(decoded, order);
    }

    #[test]
    fn malformed_payload_is_a_deserialize_error() {
        let serializer = JsonSerializer;
        let result: Result<Order, _> = serializer.deserialize(b"{\"id\": not json");

        assert!(matches!(result, Err(SerializerError::DeserializeError(_))));
    }

    #[test]
    fn wrong_shape_is_a_deserialize_error() {
        let serializer = JsonSerializer;
        let result: Result<Order, _> = serializer.deserialize(b"{\"a\": 1}");

        assert!(matches!(result, Err(SerializerError::DeserializeError(_))));
    }

    #[test]
    fn advertises_json_content_type() {
        assert_eq!(JsonSerializer.content_type(), "application/json");
    }
}
