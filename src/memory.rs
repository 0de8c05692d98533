// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker that lives inside the process and implements the broker seam.
//! It routes through topic, direct, fanout and the default exchange, keeps
//! bindings as a set (re-binding is a no-op, as on a real broker), deletes
//! exclusive queues with their connection and auto-delete queues with their
//! last consumer.
//!
//! It also exposes what a test needs to observe recovery: declare counters,
//! bindings and consumers per queue, [`MemoryBroker::drop_connections`] to
//! simulate a broker-side connection loss and
//! [`MemoryBroker::fail_next_connects`] to refuse reconnect attempts.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
        MessageProperties,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Whether a topic routing key matches a binding pattern.
///
/// `*` matches exactly one word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
}

struct MemoryConsumer {
    tag: String,
    connection: u64,
    channel: u64,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct MemoryQueue {
    def: QueueDefinition,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<MemoryConsumer>,
    had_consumer: bool,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    next_delivery_tag: u64,
    refused_connects: usize,
    connections_opened: usize,
    connections: HashMap<u64, Arc<watch::Sender<bool>>>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    /// (exchange, queue, routing key)
    bindings: BTreeSet<(String, String, String)>,
    exchange_declares: HashMap<String, usize>,
    queue_declares: HashMap<String, usize>,
    published: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let kind = *self.exchanges.get(exchange).ok_or_else(|| {
            AmqpError::PublishingError(format!("no exchange `{exchange}`"))
        })?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(ex, _, pattern)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Direct => pattern == routing_key,
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Topic => topic_matches(pattern, routing_key),
                    }
            })
            .map(|(_, queue, _)| queue.clone())
            .collect();
        targets.dedup();
        Ok(targets)
    }

    fn deliver(&mut self, queue_name: &str, message: StoredMessage) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            self.next_delivery_tag += 1;

            let consumer = &queue.consumers[index];
            let delivery = Delivery {
                consumer_tag: consumer.tag.clone(),
                delivery_tag: self.next_delivery_tag,
                redelivered: false,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_ok() {
                return;
            }
            queue.consumers.remove(index);
        }

        queue.messages.push_back(message);
    }

    fn drain_backlog(&mut self, queue_name: &str) {
        let backlog = match self.queues.get_mut(queue_name) {
            Some(queue) => std::mem::take(&mut queue.messages),
            None => return,
        };
        for message in backlog {
            self.deliver(queue_name, message);
        }
    }

    /// Removes matching consumers, then deletes exclusive queues owned by
    /// `closing_connection` and auto-delete queues left without consumers.
    fn remove_consumers<F>(&mut self, closing_connection: Option<u64>, should_remove: F)
    where
        F: Fn(&MemoryConsumer) -> bool,
    {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| !should_remove(c));
        }

        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| {
                (q.owner.is_some() && q.owner == closing_connection)
                    || (q.def.delete && q.had_consumer && q.consumers.is_empty())
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in doomed {
            debug!(queue = %name, "memory broker deleting queue");
            self.queues.remove(&name);
            self.bindings.retain(|(_, queue, _)| *queue != name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        if let Some(flag) = self.connections.remove(&id) {
            flag.send_replace(true);
        }
        self.remove_consumers(Some(id), |c| c.connection == id);
    }
}

/// An in-process broker. Cloning shares the same broker state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Closes every open connection as if the broker had dropped them.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().refused_connects = count;
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn exchange_declarations(&self, exchange: &str) -> usize {
        self.state
            .lock()
            .exchange_declares
            .get(exchange)
            .copied()
            .unwrap_or_default()
    }

    pub fn queue_declarations(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queue_declares
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn queue_definition(&self, queue: &str) -> Option<QueueDefinition> {
        self.state.lock().queues.get(queue).map(|q| q.def.clone())
    }

    /// Names of the queues whose name starts with `prefix`.
    pub fn queues_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .queues
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// `(exchange, routing key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|(_, q, _)| q == queue)
            .map(|(exchange, _, key)| (exchange.clone(), key.clone()))
            .collect()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue` because nobody consumes it.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn published(&self) -> usize {
        self.state.lock().published
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state.lock();
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let id = state.next_id();
        let closed = Arc::new(watch::Sender::new(false));
        state.connections.insert(id, closed.clone());
        state.connections_opened += 1;
        debug!(connection = id, "memory broker accepted connection");

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            closed,
        }))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::OperationInterrupted(
                "connection closed".to_owned(),
            ));
        }
        let id = self.broker.state.lock().next_id();
        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            broker: self.broker.clone(),
            connection_closed: self.closed.subscribe(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: MemoryBroker,
    connection_closed: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::OperationInterrupted("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        *state.exchange_declares.entry(def.name.clone()).or_default() += 1;

        match state.exchanges.get(&def.name) {
            Some(kind) if *kind != def.kind => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        *state.queue_declares.entry(def.name.clone()).or_default() += 1;

        if let Some(queue) = state.queues.get(&def.name) {
            return match queue.owner {
                Some(owner) if owner != self.connection => {
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                _ => Ok(()),
            };
        }

        state.queues.insert(
            def.name.clone(),
            MemoryQueue {
                def: def.clone(),
                owner: def.exclusive.then_some(self.connection),
                messages: VecDeque::new(),
                consumers: vec![],
                had_consumer: false,
                next_consumer: 0,
            },
        );
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        state.bindings.insert((
            binding.exchange_name.clone(),
            binding.queue_name.clone(),
            binding.routing_key.clone(),
        ));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let targets = state.route(exchange, routing_key)?;
        state.published += 1;

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body: body.to_vec(),
        };
        for queue in targets {
            state.deliver(&queue, message.clone());
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state.lock();
            let Some(memory_queue) = state.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };
            if matches!(memory_queue.owner, Some(owner) if owner != self.connection) {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }

            memory_queue.had_consumer = true;
            memory_queue.consumers.push(MemoryConsumer {
                tag: consumer_tag.to_owned(),
                connection: self.connection,
                channel: self.id,
                sender,
            });
            state.drain_backlog(queue);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, _delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn basic_nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel = self.id;
        self.broker
            .state
            .lock()
            .remove_consumers(None, |c| c.channel == channel);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !*self.connection_closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_topic_wildcards() {
        assert!(topic_matches("orders.#", "orders.created"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.eu.created"));
        assert!(topic_matches("*.created", "orders.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*.created", "orders.eu.created"));
        assert!(!topic_matches("orders.#", "invoices.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
    }

    #[tokio::test]
    async fn routes_topic_messages_to_bound_consumers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        channel
            .exchange_declare(&ExchangeDefinition::new("orders").topic().durable())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("orders_billing").durable())
            .await
            .unwrap();
        for _ in 0..2 {
            channel
                .queue_bind(
                    &QueueBinding::new("orders_billing")
                        .exchange("orders")
                        .routing_key("orders.#"),
                )
                .await
                .unwrap();
        }
        assert_eq!(broker.bindings("orders_billing").len(), 1);

        let mut deliveries = channel
            .basic_consume("orders_billing", "tag-1", true)
            .await
            .unwrap();
        channel
            .basic_publish(
                "orders",
                "orders.created",
                MessageProperties::typed("Order"),
                b"{}",
            )
            .await
            .unwrap();

        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key, "orders.created");
        assert_eq!(delivery.consumer_tag, "tag-1");
        assert_eq!(delivery.properties.kind.as_deref(), Some("Order"));
    }

    #[tokio::test]
    async fn dropping_connections_kills_exclusive_queues_and_consumers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        channel
            .queue_declare(&QueueDefinition::new("reply").exclusive().delete())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("work").durable())
            .await
            .unwrap();
        let mut deliveries = channel.basic_consume("work", "tag", true).await.unwrap();

        broker.drop_connections();

        assert!(!conn.is_open());
        assert!(!channel.is_open());
        assert!(!broker.queue_exists("reply"));
        assert!(broker.queue_exists("work"));
        assert_eq!(broker.consumer_count("work"), 0);
        assert!(deliveries.next().await.is_none());
        assert!(channel
            .basic_publish("", "work", MessageProperties::default(), b"")
            .await
            .unwrap_err()
            .is_transient());
    }

    #[tokio::test]
    async fn buffers_messages_until_a_consumer_attaches() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel
            .queue_declare(&QueueDefinition::new("work"))
            .await
            .unwrap();

        channel
            .basic_publish("", "work", MessageProperties::typed("Job"), b"1")
            .await
            .unwrap();
        assert_eq!(broker.message_count("work"), 1);

        let mut deliveries = channel.basic_consume("work", "tag", true).await.unwrap();
        assert_eq!(deliveries.next().await.unwrap().unwrap().body, b"1");
        assert_eq!(broker.message_count("work"), 0);
    }

    #[tokio::test]
    async fn refuses_connections_on_demand() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connections_opened(), 1);
    }
}
