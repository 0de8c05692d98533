// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! A message bus over RabbitMQ that keeps working across connection loss.
//!
//! The [`RecoverableBus`] owns a [`PersistentConnection`] that reconnects
//! with backoff. Subscriptions and responders are recorded as replayable
//! actions and re-declared on every new connection; per-connection state
//! (declared exchanges, reply queues, publish channels) is dropped when the
//! connection goes away.
//!
//! ```no_run
//! use recoverable_bus::{BusConfig, Message, RecoverableBus};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! impl Message for OrderPlaced {}
//!
//! # async fn run() -> Result<(), recoverable_bus::AmqpError> {
//! let bus = RecoverableBus::connect(BusConfig::from_env()?);
//! bus.subscribe("billing", &["orders.#"], |order: OrderPlaced| {
//!     println!("order {}", order.id);
//!     Ok(())
//! })
//! .await?;
//! bus.publish_with_topic(&OrderPlaced { id: 7 }, "orders.eu").await?;
//! # Ok(())
//! # }
//! ```

mod otel;

pub mod amqp;
pub mod broker;
pub mod bus;
pub mod channel;
pub mod channel_affinity;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod conventions;
pub mod correlation;
pub mod errors;
pub mod exchange;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod queue;
pub mod registry;
pub mod serializer;
pub mod topology_cache;

pub use bus::{BusPublisher, RecoverableBus};
pub use config::{BusConfig, ReconnectPolicy};
pub use connection::{ConnectionEvent, ConnectionState, PersistentConnection};
pub use conventions::{Conventions, DefaultConventions};
pub use errors::AmqpError;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBroker;
pub use serializer::{JsonSerializer, Message, Serializer};
