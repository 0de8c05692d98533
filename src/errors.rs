// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Recoverable Bus
//!
//! `AmqpError` covers every failure the bus can surface: connectivity,
//! topology declaration, publishing, consuming, payload handling and misuse of
//! the API. The connectivity subset is classified by [`AmqpError::is_transient`]
//! so callers can tell a connection mid-transition apart from a real fault.

use thiserror::Error;

/// Represents errors that can occur during bus and broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The operation needs a live connection but there is none
    #[error("not connected to the broker")]
    NotConnected,

    /// The broker interrupted the operation, usually because the connection dropped
    #[error("operation interrupted `{0}`")]
    OperationInterrupted(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing a message body
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// The inbound type tag differs from the type the consumer expects
    #[error("unexpected message type `{actual}`, expected `{expected}`")]
    TypeMismatch { expected: String, actual: String },

    /// The application handler or responder failed
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A required argument or configuration value is missing or invalid
    #[error("invalid argument `{0}`")]
    InvalidArgument(String),

    /// Error loading the bus configuration
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// The connection did not come back within the allowed time
    #[error("timed out waiting for a connection")]
    ConnectionTimeout,

    /// The bus was disposed
    #[error("bus disposed")]
    Disposed,
}

impl AmqpError {
    /// Whether the error belongs to the transient-connectivity class.
    ///
    /// Transient errors happen while the connection is down or being
    /// re-established. Subscription registration swallows them because the
    /// next replay redoes the work against the new connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::NotConnected
                | AmqpError::OperationInterrupted(_)
                | AmqpError::ConnectionError(_)
                | AmqpError::ChannelError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connectivity_errors_as_transient() {
        assert!(AmqpError::NotConnected.is_transient());
        assert!(AmqpError::OperationInterrupted("closed".into()).is_transient());
        assert!(AmqpError::ChannelError.is_transient());
        assert!(AmqpError::ConnectionError("refused".into()).is_transient());
    }

    #[test]
    fn keeps_contract_and_declaration_errors_fatal() {
        assert!(!AmqpError::DeclareQueueError("orders".into()).is_transient());
        assert!(!AmqpError::TypeMismatch {
            expected: "A".into(),
            actual: "B".into()
        }
        .is_transient());
        assert!(!AmqpError::InvalidArgument("subscription_id".into()).is_transient());
    }

    #[test]
    fn formats_binding_error_with_both_names() {
        let err = AmqpError::BindingExchangeToQueueError("orders".into(), "orders_billing".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `orders` to queue `orders_billing`"
        );
    }
}
