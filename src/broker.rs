// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The bus talks to the broker only through the traits in this module:
//! a [`BrokerConnector`] opens physical connections, a [`BrokerConnection`]
//! hands out channels and reports its own loss, and a [`BrokerChannel`]
//! carries the declare/bind/publish/consume surface.
//!
//! [`crate::amqp`] implements the seam on top of `lapin`. The `memory`
//! module, behind the `testing` feature, implements it in-process.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Content type stamped on every message the bus publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of deliveries produced by a consumer; it ends when the channel dies.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// The subset of message properties the bus reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Type tag checked by consumers before deserializing.
    pub kind: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Properties for a message of the given type with a fresh message id.
    pub fn typed(kind: &str) -> MessageProperties {
        MessageProperties {
            kind: Some(kind.to_owned()),
            reply_to: None,
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            headers: BTreeMap::default(),
        }
    }

    pub fn with_reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A logical channel on a physical connection.
///
/// Channels must not be shared between concurrent publishers; the bus gives
/// every worker its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Closes the channel. Closing an already dead channel is not an error.
    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// One physical connection to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// Opens physical connections; called again by the reconnect loop after every loss.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}
