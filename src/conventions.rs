// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Naming Conventions
//!
//! Maps message types and subscription ids to exchange and queue names.

use crate::config::DEFAULT_RPC_EXCHANGE;
use uuid::Uuid;

pub trait Conventions: Send + Sync {
    /// Topic exchange a message type is published to.
    fn exchange_name(&self, message_type: &str) -> String;

    /// Durable queue shared by every subscriber using `subscription_id`.
    fn queue_name(&self, message_type: &str, subscription_id: &str) -> String;

    /// Direct exchange carrying RPC requests.
    fn rpc_exchange_name(&self) -> String;

    /// A fresh, unique name for an RPC reply queue.
    fn rpc_reply_queue_name(&self) -> String;
}

/// Exchange named after the message type, queue named
/// `{message type}_{subscription id}`.
#[derive(Debug, Clone)]
pub struct DefaultConventions {
    rpc_exchange: String,
}

impl Default for DefaultConventions {
    fn default() -> Self {
        DefaultConventions::new(DEFAULT_RPC_EXCHANGE)
    }
}

impl DefaultConventions {
    pub fn new(rpc_exchange: &str) -> DefaultConventions {
        DefaultConventions {
            rpc_exchange: rpc_exchange.to_owned(),
        }
    }
}

impl Conventions for DefaultConventions {
    fn exchange_name(&self, message_type: &str) -> String {
        message_type.to_owned()
    }

    fn queue_name(&self, message_type: &str, subscription_id: &str) -> String {
        format!("{message_type}_{subscription_id}")
    }

    fn rpc_exchange_name(&self) -> String {
        self.rpc_exchange.clone()
    }

    fn rpc_reply_queue_name(&self) -> String {
        format!("{}.response.{}", self.rpc_exchange, Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_names_from_the_message_type() {
        let conventions = DefaultConventions::default();

        assert_eq!(conventions.exchange_name("shop.Order"), "shop.Order");
        assert_eq!(
            conventions.queue_name("shop.Order", "billing"),
            "shop.Order_billing"
        );
        assert_eq!(conventions.rpc_exchange_name(), DEFAULT_RPC_EXCHANGE);
    }

    #[test]
    fn reply_queue_names_are_unique() {
        let conventions = DefaultConventions::new("rpc");
        let first = conventions.rpc_reply_queue_name();
        let second = conventions.rpc_reply_queue_name();

        assert!(first.starts_with("rpc.response."));
        assert_ne!(first, second);
    }
}
