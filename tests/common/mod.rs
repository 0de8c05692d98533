// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use recoverable_bus::{
    BusConfig, DefaultConventions, JsonSerializer, MemoryBroker, Message, PersistentConnection,
    ReconnectPolicy, RecoverableBus,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedReceiver;

pub const REPLY_QUEUE_PREFIX: &str = "recoverable_bus_rpc.response.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub id: u32,
}

impl Message for OrderPlaced {
    fn message_type() -> String {
        "OrderPlaced".to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub value: u32,
}

impl Message for Ping {
    fn message_type() -> String {
        "Ping".to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub value: u32,
}

impl Message for Pong {
    fn message_type() -> String {
        "Pong".to_owned()
    }
}

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay_ms: 5,
        max_delay_ms: 20,
    }
}

/// A bus on `broker` that may not be connected yet.
pub fn bus_on(broker: &MemoryBroker) -> RecoverableBus {
    bus_with(
        broker,
        BusConfig {
            response_timeout_ms: 2_000,
            ..BusConfig::default()
        },
    )
}

pub fn bus_with(broker: &MemoryBroker, config: BusConfig) -> RecoverableBus {
    let connection = PersistentConnection::start(Arc::new(broker.clone()), fast_reconnect());
    RecoverableBus::new(
        connection,
        Arc::new(DefaultConventions::default()),
        JsonSerializer,
        config,
    )
}

/// A bus on `broker` with its first connection established.
pub async fn connected_bus(broker: &MemoryBroker) -> RecoverableBus {
    let bus = bus_on(broker);
    eventually(|| bus.is_connected()).await;
    bus
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("nothing received in time")
        .expect("sender dropped")
}

/// Drops every broker connection and waits for the bus to come back on the
/// next generation.
pub async fn bounce(broker: &MemoryBroker, bus: &RecoverableBus) {
    let generation = bus.connection().generation();
    broker.drop_connections();
    eventually(|| bus.is_connected() && bus.connection().generation() > generation).await;
}
