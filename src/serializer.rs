// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Serialization
//!
//! A [`Message`] knows its wire type tag; a [`Serializer`] turns messages into
//! bodies and back. The type tag travels in the message `type` property and is
//! checked by every consumer before the body is deserialized.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// A type that can travel over the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag written to the `type` property. Defaults to the Rust type path.
    fn message_type() -> String {
        std::any::type_name::<Self>().to_owned()
    }
}

pub trait Serializer: Send + Sync + 'static {
    fn message_to_bytes<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, AmqpError>;

    fn bytes_to_message<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AmqpError>;

    fn serialize_type<T: Message>(&self) -> String {
        T::message_type()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn message_to_bytes<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })
    }

    fn bytes_to_message<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(bytes).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    impl Message for Order {}

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        id: u32,
    }

    impl Message for Invoice {
        fn message_type() -> String {
            "billing.Invoice".to_owned()
        }
    }

    #[test]
    fn type_tags_default_to_the_type_path() {
        assert!(JsonSerializer.serialize_type::<Order>().ends_with("Order"));
        assert_eq!(JsonSerializer.serialize_type::<Invoice>(), "billing.Invoice");
    }

    #[test]
    fn rejects_malformed_bodies() {
        let err = JsonSerializer
            .bytes_to_message::<Order>(b"not json")
            .unwrap_err();
        assert!(matches!(err, AmqpError::ParsePayloadError(_)));
    }

    #[test]
    fn decodes_what_it_encodes() {
        let bytes = JsonSerializer.message_to_bytes(&Order { id: 7 }).unwrap();
        assert_eq!(bytes, br#"{"id":7}"#);
        assert_eq!(
            JsonSerializer.bytes_to_message::<Order>(&bytes).unwrap(),
            Order { id: 7 }
        );
    }
}
