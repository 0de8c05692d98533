// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Every subscription and responder is captured as a [`SubscriptionAction`]:
//! a replayable closure that opens a channel, declares its exchange, queue and
//! bindings, and starts consuming. Actions are registered once, run right
//! away, and run again after every reconnect.
//!
//! An action runs at most once per connection generation, so a registration
//! racing a replay never starts a second consumer.

use crate::{
    connection::{ConnectionHandle, PersistentConnection},
    errors::AmqpError,
};
use futures_util::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

pub type ActionFn =
    Arc<dyn Fn(ConnectionHandle) -> BoxFuture<'static, Result<(), AmqpError>> + Send + Sync>;

pub struct SubscriptionAction {
    name: String,
    run: ActionFn,
    /// Generation the action last completed on; 0 means never.
    generation: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

impl SubscriptionAction {
    pub fn new<F>(name: &str, run: F) -> Arc<SubscriptionAction>
    where
        F: Fn(ConnectionHandle) -> BoxFuture<'static, Result<(), AmqpError>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(SubscriptionAction {
            name: name.to_owned(),
            run: Arc::new(run),
            generation: AtomicU64::new(0),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generation the action last completed on, 0 if it never did.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Runs the action against `handle` unless it already completed on that
    /// generation. Returns whether it ran.
    pub async fn execute(&self, handle: ConnectionHandle) -> Result<bool, AmqpError> {
        let _gate = self.gate.lock().await;
        if self.generation.load(Ordering::SeqCst) >= handle.generation {
            return Ok(false);
        }

        let generation = handle.generation;
        (self.run)(handle).await?;
        self.generation.store(generation, Ordering::SeqCst);
        debug!(action = %self.name, generation, "subscription action executed");
        Ok(true)
    }
}

pub struct SubscriptionRegistry {
    actions: RwLock<Vec<Arc<SubscriptionAction>>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        SubscriptionRegistry::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> SubscriptionRegistry {
        SubscriptionRegistry {
            actions: RwLock::new(vec![]),
        }
    }

    /// Appends `action` and executes it once.
    ///
    /// Transient connectivity failures are swallowed: the action stays
    /// registered and the next replay completes it. Any other failure removes
    /// the action again and is returned to the caller.
    pub async fn register(
        &self,
        action: Arc<SubscriptionAction>,
        connection: &PersistentConnection,
    ) -> Result<(), AmqpError> {
        self.actions.write().push(action.clone());

        let result = match connection.handle() {
            Ok(handle) => action.execute(handle).await.map(|_| ()),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                info!(
                    action = action.name(),
                    error = err.to_string(),
                    "connection unavailable, action will run on reconnect"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    action = action.name(),
                    error = err.to_string(),
                    "failure to execute subscription action"
                );
                self.actions.write().retain(|a| !Arc::ptr_eq(a, &action));
                Err(err)
            }
        }
    }

    /// Executes every registered action against `handle`. Actions are
    /// independent, so they run concurrently; failures are logged and left
    /// for the next reconnect.
    pub async fn replay_all(&self, handle: &ConnectionHandle) -> usize {
        let actions: Vec<Arc<SubscriptionAction>> = self.actions.read().clone();
        debug!(
            count = actions.len(),
            generation = handle.generation,
            "replaying subscription actions"
        );

        let results = join_all(actions.iter().map(|a| a.execute(handle.clone()))).await;

        let mut executed = 0;
        for (action, result) in actions.iter().zip(results) {
            match result {
                Ok(true) => executed += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    action = action.name(),
                    error = err.to_string(),
                    "failure to replay subscription action"
                ),
            }
        }
        executed
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
