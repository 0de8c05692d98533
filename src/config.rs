// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Configuration
//!
//! Connection credentials, flow-control and reconnect tuning for the bus.
//! Every field has a default so a partial environment is enough to start.

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Default number of unacknowledged deliveries a consumer channel may hold.
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;
/// Default name of the direct exchange carrying RPC requests.
pub const DEFAULT_RPC_EXCHANGE: &str = "recoverable_bus_rpc";
/// Publish channels kept before idle ones are closed.
pub const DEFAULT_PUBLISH_CHANNELS: usize = 64;

/// Settings for the bus and its persistent connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    pub prefetch_count: u16,
    pub rpc_exchange: String,
    /// How long a responder waits for the connection to come back before
    /// giving up on delivering its response.
    pub response_timeout_ms: u64,
    pub publish_channels: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "recoverable-bus".to_owned(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            rpc_exchange: DEFAULT_RPC_EXCHANGE.to_owned(),
            response_timeout_ms: 30_000,
            publish_channels: DEFAULT_PUBLISH_CHANNELS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BusConfig {
    /// Loads the configuration from `RABBITMQ_*` environment variables.
    ///
    /// Nested fields use a double underscore, e.g.
    /// `RABBITMQ_RECONNECT__MAX_DELAY_MS=10000`.
    pub fn from_env() -> Result<BusConfig, AmqpError> {
        Config::builder()
            .add_source(
                Environment::with_prefix("RABBITMQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize::<BusConfig>())
            .map_err(|err| AmqpError::ConfigurationError(err.to_string()))
    }

    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Delay policy applied between failed connection attempts.
///
/// The first retry waits `initial_delay_ms`, each further attempt doubles the
/// delay up to `max_delay_ms`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u64.saturating_pow(attempt - 1);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}
