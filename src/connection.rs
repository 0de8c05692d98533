// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Connection
//!
//! Owns the single physical connection to the broker and keeps it alive.
//! A supervisor task connects, waits for the connection to be lost, and
//! reconnects with exponential backoff until [`PersistentConnection::dispose`]
//! is called.
//!
//! Every successful connect starts a new *generation*. Lifecycle transitions
//! are published as [`ConnectionEvent`]s from the supervisor task, never from
//! the broker's I/O callbacks: exactly one `Connected` per successful connect
//! and exactly one `Disconnected` per loss.

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector},
    config::ReconnectPolicy,
    errors::AmqpError,
};
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A lifecycle transition of the persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { generation: u64 },
    Disconnected { generation: u64 },
}

/// The live connection together with the generation it belongs to.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub generation: u64,
    pub connection: Arc<dyn BrokerConnection>,
}

impl ConnectionHandle {
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.connection.create_channel().await
    }
}

pub struct PersistentConnection {
    connector: Arc<dyn BrokerConnector>,
    policy: ReconnectPolicy,
    current: RwLock<Option<ConnectionHandle>>,
    last_generation: Mutex<u64>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentConnection {
    /// Creates the connection and starts the reconnect loop on the current
    /// tokio runtime. The first connect attempt happens in the background.
    pub fn start(
        connector: Arc<dyn BrokerConnector>,
        policy: ReconnectPolicy,
    ) -> Arc<PersistentConnection> {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let connection = Arc::new(PersistentConnection {
            connector,
            policy,
            current: RwLock::new(None),
            last_generation: Mutex::new(0),
            state: watch::Sender::new(ConnectionState::Disconnected),
            events,
            shutdown: watch::Sender::new(false),
            supervisor: Mutex::new(None),
        });

        let handle = tokio::spawn(connection.clone().supervise());
        *connection.supervisor.lock() = Some(handle);
        connection
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Generation of the most recent successful connect; 0 before the first.
    pub fn generation(&self) -> u64 {
        *self.last_generation.lock()
    }

    /// Subscribes to lifecycle events. Only events sent after the call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The live connection, or `NotConnected` while disconnected.
    pub fn handle(&self) -> Result<ConnectionHandle, AmqpError> {
        self.current.read().clone().ok_or(AmqpError::NotConnected)
    }

    /// Opens a new channel on the live connection.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.handle()?.create_channel().await
    }

    /// Waits until the connection is up, for at most `timeout` in total.
    ///
    /// A handle whose physical connection is already closed is not returned;
    /// the wait goes on until the supervisor has replaced it.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<ConnectionHandle, AmqpError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.subscribe();
        loop {
            if *self.shutdown.borrow() {
                return Err(AmqpError::Disposed);
            }
            if let Ok(handle) = self.handle() {
                if handle.connection.is_open() {
                    return Ok(handle);
                }
            }

            match tokio::time::timeout_at(deadline, state.changed()).await {
                Err(_) => return Err(AmqpError::ConnectionTimeout),
                Ok(Err(_)) => return Err(AmqpError::Disposed),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Stops the reconnect loop and closes the physical connection.
    pub async fn dispose(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("disposing persistent connection");

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                error!(error = err.to_string(), "connection supervisor failed");
            }
        }

        let current = self.current.write().take();
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(handle) = current {
            if let Err(err) = handle.connection.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            debug!(attempt, "connecting to the broker...");
            let connection = match self.connector.connect().await {
                Ok(connection) => connection,
                Err(err) => {
                    attempt += 1;
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        error = err.to_string(),
                        delay_ms = delay.as_millis() as u64,
                        "failure to connect, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.wait_for(|stop| *stop) => break,
                    }
                }
            };
            attempt = 0;

            let generation = {
                let mut last = self.last_generation.lock();
                *last += 1;
                *last
            };
            *self.current.write() = Some(ConnectionHandle {
                generation,
                connection: connection.clone(),
            });
            self.state.send_replace(ConnectionState::Connected);
            info!(generation, "connected to the broker");
            let _ = self.events.send(ConnectionEvent::Connected { generation });

            tokio::select! {
                _ = connection.closed() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            self.current.write().take();
            self.state.send_replace(ConnectionState::Disconnected);
            warn!(generation, "connection to the broker lost");
            let _ = self.events.send(ConnectionEvent::Disconnected { generation });
        }

        debug!("connection supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;

    /// Hands out connections that are already closed, so the supervisor
    /// flaps between connected and disconnected.
    struct ClosingConnector(MemoryBroker);

    #[async_trait]
    impl BrokerConnector for ClosingConnector {
        async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let connection = self.0.connect().await?;
            connection.close().await?;
            Ok(connection)
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: 5,
            max_delay_ms: 20,
        }
    }

    #[tokio::test]
    async fn emits_one_event_per_transition() {
        let broker = MemoryBroker::new();
        let connection = PersistentConnection::start(Arc::new(broker.clone()), fast_policy());
        let mut events = connection.subscribe();

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { generation: 1 }
        );
        assert!(connection.is_connected());

        broker.drop_connections();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { generation: 1 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { generation: 2 }
        );
        assert_eq!(connection.handle().unwrap().generation, 2);
        assert_eq!(broker.connections_opened(), 2);

        connection.dispose().await;
    }

    #[tokio::test]
    async fn retries_refused_connects_with_backoff() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(3);
        let connection = PersistentConnection::start(Arc::new(broker.clone()), fast_policy());

        let handle = connection
            .wait_connected(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(handle.generation, 1);
        assert_eq!(broker.connections_opened(), 1);
        connection.dispose().await;
    }

    #[tokio::test]
    async fn refuses_channels_while_disconnected() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(usize::MAX);
        let connection = PersistentConnection::start(Arc::new(broker), fast_policy());

        assert_eq!(
            connection.create_channel().await.err(),
            Some(AmqpError::NotConnected)
        );
        assert_eq!(
            connection
                .wait_connected(Duration::from_millis(30))
                .await
                .err(),
            Some(AmqpError::ConnectionTimeout)
        );
        connection.dispose().await;
    }

    #[tokio::test]
    async fn waiting_is_bounded_while_the_connection_flaps() {
        let broker = MemoryBroker::new();
        let connection =
            PersistentConnection::start(Arc::new(ClosingConnector(broker.clone())), fast_policy());
        let started = Instant::now();

        let result = connection.wait_connected(Duration::from_millis(50)).await;

        assert_eq!(result.err(), Some(AmqpError::ConnectionTimeout));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(broker.connections_opened() > 1);
        connection.dispose().await;
    }

    #[tokio::test]
    async fn waiting_fails_once_disposed() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(usize::MAX);
        let connection = PersistentConnection::start(Arc::new(broker), fast_policy());
        connection.dispose().await;

        assert_eq!(
            connection
                .wait_connected(Duration::from_secs(5))
                .await
                .err(),
            Some(AmqpError::Disposed)
        );
    }

    #[tokio::test]
    async fn dispose_closes_the_physical_connection() {
        let broker = MemoryBroker::new();
        let connection = PersistentConnection::start(Arc::new(broker.clone()), fast_policy());
        connection
            .wait_connected(Duration::from_secs(5))
            .await
            .unwrap();

        connection.dispose().await;

        assert!(!connection.is_connected());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(
            connection.handle().err(),
            Some(AmqpError::NotConnected)
        );
    }
}
