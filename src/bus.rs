// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recoverable Bus
//!
//! Publish/subscribe and request/response on top of a [`PersistentConnection`]
//! that survive connection loss without help from the application.
//!
//! Subscriptions and responders are registered as replayable actions. When the
//! connection drops, the bus forgets every declaration, reply queue and
//! publish channel of the dead generation; when it comes back, every action is
//! replayed against the new connection. Both transitions are handled on a
//! single lifecycle task in the order the connection reported them, so a
//! replay never races the cleanup of the previous generation.
//!
//! Deliveries are auto-acknowledged: a message whose handler fails is logged
//! and dropped, not redelivered.

use crate::{
    amqp::AmqpConnector,
    broker::{BrokerChannel, Delivery, MessageProperties},
    channel::OpenChannels,
    channel_affinity::ChannelAffinity,
    config::BusConfig,
    connection::{ConnectionEvent, ConnectionHandle, PersistentConnection},
    consumer::{AckMode, ConsumerFactory, DeliveryHandler},
    conventions::{Conventions, DefaultConventions},
    correlation::ResponseCorrelationCache,
    errors::AmqpError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    otel,
    queue::{QueueBinding, QueueDefinition},
    registry::{SubscriptionAction, SubscriptionRegistry},
    serializer::{JsonSerializer, Message, Serializer},
    topology_cache::TopologyCache,
};
use futures_util::{future, FutureExt};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Routing key used by [`RecoverableBus::publish`].
pub const DEFAULT_TOPIC: &str = "#";

pub struct RecoverableBus<S: Serializer = JsonSerializer> {
    inner: Arc<BusInner<S>>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

struct BusInner<S> {
    config: BusConfig,
    connection: Arc<PersistentConnection>,
    conventions: Arc<dyn Conventions>,
    serializer: Arc<S>,
    consumers: ConsumerFactory,
    registry: SubscriptionRegistry,
    exchanges: TopologyCache,
    request_types: TopologyCache,
    responses: ResponseCorrelationCache,
    affinity: ChannelAffinity,
    channels: OpenChannels,
    disposed: AtomicBool,
}

#[derive(Clone)]
struct SubscriptionDefinition {
    queue: String,
    exchange: String,
    topics: Vec<String>,
    on_delivery: DeliveryHandler,
}

impl RecoverableBus<JsonSerializer> {
    /// Connects to RabbitMQ through lapin with the default conventions and
    /// JSON bodies. The connection is established in the background.
    pub fn connect(config: BusConfig) -> RecoverableBus<JsonSerializer> {
        let connection = PersistentConnection::start(
            Arc::new(AmqpConnector::new(&config)),
            config.reconnect.clone(),
        );
        let conventions = Arc::new(DefaultConventions::new(&config.rpc_exchange));
        RecoverableBus::new(connection, conventions, JsonSerializer, config)
    }
}

impl<S: Serializer> RecoverableBus<S> {
    /// Builds a bus on top of `connection` and starts following its lifecycle.
    pub fn new(
        connection: Arc<PersistentConnection>,
        conventions: Arc<dyn Conventions>,
        serializer: S,
        config: BusConfig,
    ) -> RecoverableBus<S> {
        let events = connection.subscribe();
        let affinity = ChannelAffinity::with_capacity(config.publish_channels);
        let inner = Arc::new(BusInner {
            config,
            connection,
            conventions,
            serializer: Arc::new(serializer),
            consumers: ConsumerFactory::new(),
            registry: SubscriptionRegistry::new(),
            exchanges: TopologyCache::new(),
            request_types: TopologyCache::new(),
            responses: ResponseCorrelationCache::new(),
            affinity,
            channels: OpenChannels::new(),
            disposed: AtomicBool::new(false),
        });

        let lifecycle = tokio::spawn(follow_lifecycle(Arc::downgrade(&inner), events));

        RecoverableBus {
            inner,
            lifecycle: Mutex::new(Some(lifecycle)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection(&self) -> &Arc<PersistentConnection> {
        &self.inner.connection
    }

    /// Number of registered subscriptions and responders.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// A publisher owning its own channel, for workers that publish
    /// concurrently from the same thread.
    pub fn publisher(&self) -> BusPublisher<S> {
        BusPublisher {
            inner: self.inner.clone(),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    /// Publishes `message` with the routing key [`DEFAULT_TOPIC`].
    pub async fn publish<T: Message>(&self, message: &T) -> Result<(), AmqpError> {
        self.publish_with_topic(message, DEFAULT_TOPIC).await
    }

    /// Publishes `message` to its type's topic exchange on the calling
    /// thread's publish channel.
    pub async fn publish_with_topic<T: Message>(
        &self,
        message: &T,
        topic: &str,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_alive()?;
        let handle = self.inner.connection.handle()?;
        let channel = self
            .inner
            .affinity
            .get_or_create(&handle, &self.inner.channels)
            .await?;
        self.inner
            .publish_message(&channel, handle.generation, message, topic)
            .await
    }

    /// Subscribes a synchronous handler; an `Err` fails that delivery.
    pub async fn subscribe<T, F>(
        &self,
        subscription_id: &str,
        topics: &[&str],
        handler: F,
    ) -> Result<(), AmqpError>
    where
        T: Message,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_async(subscription_id, topics, move |message: T| {
            future::ready(handler(message))
        })
        .await
    }

    /// Subscribes `handler` to messages of type `T` routed with any of
    /// `topics` (every topic when empty).
    ///
    /// Subscribers sharing a `subscription_id` share one durable queue and
    /// compete for its messages. The subscription is re-declared after every
    /// reconnect.
    pub async fn subscribe_async<T, F, Fut>(
        &self,
        subscription_id: &str,
        topics: &[&str],
        handler: F,
    ) -> Result<(), AmqpError>
    where
        T: Message,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.ensure_alive()?;
        if subscription_id.trim().is_empty() {
            return Err(AmqpError::InvalidArgument("subscription_id".to_owned()));
        }

        let message_type = self.inner.serializer.serialize_type::<T>();
        let topics = if topics.is_empty() {
            vec![DEFAULT_TOPIC.to_owned()]
        } else {
            topics.iter().map(|topic| topic.to_string()).collect()
        };

        let serializer = self.inner.serializer.clone();
        let expected = message_type.clone();
        let handler = Arc::new(handler);
        let on_delivery: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let serializer = serializer.clone();
            let expected = expected.clone();
            let handler = handler.clone();
            async move {
                let message: T = decode(serializer.as_ref(), &expected, &delivery)?;
                handler(message)
                    .await
                    .map_err(|err| AmqpError::HandlerError(err.to_string()))
            }
            .boxed()
        });

        let definition = SubscriptionDefinition {
            queue: self
                .inner
                .conventions
                .queue_name(&message_type, subscription_id),
            exchange: self.inner.conventions.exchange_name(&message_type),
            topics,
            on_delivery,
        };
        debug!(
            queue = %definition.queue,
            exchange = %definition.exchange,
            "registering subscription"
        );

        let weak = Arc::downgrade(&self.inner);
        let name = format!("subscribe {}", definition.queue);
        let action = SubscriptionAction::new(&name, move |handle| {
            let weak = weak.clone();
            let definition = definition.clone();
            async move {
                let inner = weak.upgrade().ok_or(AmqpError::Disposed)?;
                inner.declare_subscription(handle, &definition).await
            }
            .boxed()
        });

        self.inner
            .registry
            .register(action, &self.inner.connection)
            .await
    }

    /// Sends `request` and routes its response to `on_response`.
    ///
    /// Requests sharing a `correlation_id` (and response type) share one
    /// exclusive reply queue per connection generation; the handler given with
    /// the request that created the queue receives every response on it.
    /// No timeout is applied: a request whose responder fails never completes.
    pub async fn request<Req, Resp, F>(
        &self,
        correlation_id: &str,
        request: &Req,
        on_response: F,
    ) -> Result<(), AmqpError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(Resp) + Send + Sync + 'static,
    {
        self.inner.ensure_alive()?;
        if correlation_id.trim().is_empty() {
            return Err(AmqpError::InvalidArgument("correlation_id".to_owned()));
        }
        if !self.inner.connection.is_connected() {
            return Err(AmqpError::NotConnected);
        }
        let handle = self.inner.connection.handle()?;

        let request_type = self.inner.serializer.serialize_type::<Req>();
        let response_type = self.inner.serializer.serialize_type::<Resp>();
        let body = self.inner.serializer.message_to_bytes(request)?;

        let key = format!("{response_type}:{correlation_id}");
        let reply_queue = self
            .inner
            .responses
            .reply_queue(&key, handle.generation, || {
                self.inner.start_reply_queue::<Resp, F>(&handle, on_response)
            })
            .await?;

        let channel = self
            .inner
            .affinity
            .get_or_create(&handle, &self.inner.channels)
            .await?;
        self.inner
            .declare_rpc_topology(&channel, handle.generation, &request_type)
            .await?;

        let properties = MessageProperties::typed(&request_type).with_reply_to(&reply_queue);
        self.inner
            .publish_raw(
                &channel,
                &self.inner.conventions.rpc_exchange_name(),
                &request_type,
                properties,
                &body,
            )
            .await
    }

    /// Registers a synchronous responder; an `Err` sends no response.
    pub async fn respond<Req, Resp, F>(&self, responder: F) -> Result<(), AmqpError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> anyhow::Result<Resp> + Send + Sync + 'static,
    {
        self.respond_async(move |request: Req| future::ready(responder(request)))
            .await
    }

    /// Serves requests of type `Req`, replying to each caller's reply queue.
    ///
    /// A response produced while the connection is down waits for the
    /// connection to come back, up to the configured response timeout. When
    /// the responder fails no response is sent.
    pub async fn respond_async<Req, Resp, F, Fut>(&self, responder: F) -> Result<(), AmqpError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.inner.ensure_alive()?;
        let request_type = self.inner.serializer.serialize_type::<Req>();

        let weak = Arc::downgrade(&self.inner);
        let on_delivery: DeliveryHandler = {
            let weak = weak.clone();
            let expected = request_type.clone();
            let responder = Arc::new(responder);
            Arc::new(move |delivery: Delivery| {
                let weak = weak.clone();
                let expected = expected.clone();
                let responder = responder.clone();
                async move {
                    let inner = weak.upgrade().ok_or(AmqpError::Disposed)?;
                    let request: Req = decode(inner.serializer.as_ref(), &expected, &delivery)?;
                    let reply_to = match delivery.properties.reply_to.as_deref() {
                        Some(queue) if !queue.is_empty() => queue.to_owned(),
                        _ => {
                            error!(request_type = %expected, "request without reply-to");
                            return Err(AmqpError::InvalidArgument("reply_to".to_owned()));
                        }
                    };

                    let response = responder(request)
                        .await
                        .map_err(|err| AmqpError::HandlerError(err.to_string()))?;
                    inner.publish_response(&reply_to, &response).await
                }
                .boxed()
            })
        };

        let name = format!("respond {request_type}");
        let action = SubscriptionAction::new(&name, move |handle| {
            let weak = weak.clone();
            let request_type = request_type.clone();
            let on_delivery = on_delivery.clone();
            async move {
                let inner = weak.upgrade().ok_or(AmqpError::Disposed)?;
                inner
                    .declare_responder(handle, &request_type, on_delivery)
                    .await
            }
            .boxed()
        });

        self.inner
            .registry
            .register(action, &self.inner.connection)
            .await
    }

    /// Aborts every open channel, disposes the connection and stops every
    /// consumer. Later calls on the bus fail with [`AmqpError::Disposed`].
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing bus");

        if let Some(lifecycle) = self.lifecycle.lock().take() {
            lifecycle.abort();
        }
        self.inner.channels.abort_all().await;
        self.inner.affinity.clear();
        self.inner.connection.dispose().await;
        self.inner.consumers.close();
    }
}

/// A publisher with a channel of its own, recreated after reconnects.
pub struct BusPublisher<S: Serializer = JsonSerializer> {
    inner: Arc<BusInner<S>>,
    channel: tokio::sync::Mutex<Option<(u64, Arc<dyn BrokerChannel>)>>,
}

impl<S: Serializer> BusPublisher<S> {
    pub async fn publish<T: Message>(&self, message: &T) -> Result<(), AmqpError> {
        self.publish_with_topic(message, DEFAULT_TOPIC).await
    }

    pub async fn publish_with_topic<T: Message>(
        &self,
        message: &T,
        topic: &str,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_alive()?;
        let handle = self.inner.connection.handle()?;

        let channel = {
            let mut slot = self.channel.lock().await;
            match slot.as_ref() {
                Some((generation, channel))
                    if *generation == handle.generation && channel.is_open() =>
                {
                    channel.clone()
                }
                _ => {
                    let channel = self.inner.channels.open(&handle).await?;
                    *slot = Some((handle.generation, channel.clone()));
                    channel
                }
            }
        };

        self.inner
            .publish_message(&channel, handle.generation, message, topic)
            .await
    }
}

async fn follow_lifecycle<S: Serializer>(
    bus: Weak<BusInner<S>>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let event = events.recv().await;
        let Some(inner) = bus.upgrade() else {
            break;
        };

        match event {
            Ok(ConnectionEvent::Disconnected { generation }) => {
                inner.on_disconnected(generation)
            }
            Ok(ConnectionEvent::Connected { generation }) => inner.on_connected(generation).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed connection events, resynchronizing");
                match inner.connection.handle() {
                    Ok(handle) => {
                        inner.on_disconnected(handle.generation.saturating_sub(1));
                        inner.on_connected(handle.generation).await;
                    }
                    Err(_) => inner.on_disconnected(inner.connection.generation()),
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("bus lifecycle stopped");
}

/// Checks the type tag of `delivery` and deserializes its body.
fn decode<S: Serializer, T: Message>(
    serializer: &S,
    expected: &str,
    delivery: &Delivery,
) -> Result<T, AmqpError> {
    let actual = delivery.properties.kind.as_deref().unwrap_or_default();
    if actual != expected {
        error!(
            expected,
            actual,
            routing_key = %delivery.routing_key,
            "unexpected message type"
        );
        return Err(AmqpError::TypeMismatch {
            expected: expected.to_owned(),
            actual: actual.to_owned(),
        });
    }
    serializer.bytes_to_message(&delivery.body)
}

impl<S: Serializer> BusInner<S> {
    fn ensure_alive(&self) -> Result<(), AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(AmqpError::Disposed)
        } else {
            Ok(())
        }
    }

    fn on_disconnected(&self, generation: u64) {
        info!(generation, "connection lost, clearing caches");
        self.exchanges.clear_through(generation);
        self.request_types.clear_through(generation);
        self.responses.clear_through(generation);
        self.affinity.clear_through(generation);
        self.channels.forget_closed();
    }

    async fn on_connected(&self, generation: u64) {
        let handle = match self.connection.handle() {
            Ok(handle) if handle.generation == generation => handle,
            _ => {
                debug!(generation, "skipping replay for a stale generation");
                return;
            }
        };

        let replayed = self.registry.replay_all(&handle).await;
        info!(generation, replayed, "subscriptions restored");
    }

    async fn declare_exchange(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        generation: u64,
        def: ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        let name = def.name().to_owned();
        self.exchanges
            .declare_once(&name, generation, || async move {
                channel.exchange_declare(&def).await
            })
            .await
            .map(|_| ())
    }

    /// Declares the RPC exchange plus the queue and binding for `request_type`.
    async fn declare_rpc_topology(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        generation: u64,
        request_type: &str,
    ) -> Result<(), AmqpError> {
        let rpc_exchange = self.conventions.rpc_exchange_name();
        self.request_types
            .declare_once(request_type, generation, || async {
                channel
                    .exchange_declare(&ExchangeDefinition::new(&rpc_exchange).direct().durable())
                    .await?;
                channel
                    .queue_declare(&QueueDefinition::new(request_type).durable())
                    .await?;
                channel
                    .queue_bind(
                        &QueueBinding::new(request_type)
                            .exchange(&rpc_exchange)
                            .routing_key(request_type),
                    )
                    .await
            })
            .await
            .map(|_| ())
    }

    async fn publish_raw(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        exchange: &str,
        routing_key: &str,
        mut properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        otel::inject_context(&mut properties);
        channel
            .basic_publish(exchange, routing_key, properties, body)
            .await
    }

    async fn publish_message<T: Message>(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        generation: u64,
        message: &T,
        topic: &str,
    ) -> Result<(), AmqpError> {
        let message_type = self.serializer.serialize_type::<T>();
        let exchange = self.conventions.exchange_name(&message_type);
        let body = self.serializer.message_to_bytes(message)?;

        self.declare_exchange(
            channel,
            generation,
            ExchangeDefinition::new(&exchange).topic().durable(),
        )
        .await?;
        self.publish_raw(
            channel,
            &exchange,
            topic,
            MessageProperties::typed(&message_type),
            &body,
        )
        .await
    }

    /// Opens a consumer channel with the configured prefetch limit.
    async fn open_consumer_channel(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.channels.open(handle).await?;
        if let Err(err) = channel.basic_qos(self.config.prefetch_count).await {
            let _ = channel.close().await;
            return Err(err);
        }
        Ok(channel)
    }

    async fn declare_subscription(
        &self,
        handle: ConnectionHandle,
        def: &SubscriptionDefinition,
    ) -> Result<(), AmqpError> {
        let channel = self.open_consumer_channel(&handle).await?;

        let declared = async {
            self.declare_exchange(
                &channel,
                handle.generation,
                ExchangeDefinition::new(&def.exchange).topic().durable(),
            )
            .await?;
            channel
                .queue_declare(&QueueDefinition::new(&def.queue).durable())
                .await?;
            for topic in &def.topics {
                channel
                    .queue_bind(
                        &QueueBinding::new(&def.queue)
                            .exchange(&def.exchange)
                            .routing_key(topic),
                    )
                    .await?;
            }
            self.consumers
                .start_consuming(
                    channel.clone(),
                    &def.queue,
                    AckMode::Auto,
                    def.on_delivery.clone(),
                )
                .await
        }
        .await;

        match declared {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn declare_responder(
        &self,
        handle: ConnectionHandle,
        request_type: &str,
        on_delivery: DeliveryHandler,
    ) -> Result<(), AmqpError> {
        let channel = self.open_consumer_channel(&handle).await?;

        let declared = async {
            self.declare_rpc_topology(&channel, handle.generation, request_type)
                .await?;
            self.consumers
                .start_consuming(channel.clone(), request_type, AckMode::Auto, on_delivery)
                .await
        }
        .await;

        match declared {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    /// Declares an exclusive reply queue and starts consuming responses on it.
    async fn start_reply_queue<Resp, F>(
        &self,
        handle: &ConnectionHandle,
        on_response: F,
    ) -> Result<String, AmqpError>
    where
        Resp: Message,
        F: Fn(Resp) + Send + Sync + 'static,
    {
        let queue = self.conventions.rpc_reply_queue_name();
        let channel = self.channels.open(handle).await?;
        channel
            .queue_declare(&QueueDefinition::new(&queue).exclusive().delete())
            .await?;

        let serializer = self.serializer.clone();
        let expected = self.serializer.serialize_type::<Resp>();
        let on_response = Arc::new(on_response);
        let on_delivery: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let serializer = serializer.clone();
            let expected = expected.clone();
            let on_response = on_response.clone();
            async move {
                let response: Resp = decode(serializer.as_ref(), &expected, &delivery)?;
                on_response(response);
                Ok(())
            }
            .boxed()
        });

        self.consumers
            .start_consuming(channel, &queue, AckMode::Auto, on_delivery)
            .await?;
        debug!(queue, "reply queue ready");
        Ok(queue)
    }

    /// Publishes a response to the caller's reply queue, waiting for the
    /// connection to come back when it is down.
    async fn publish_response<Resp: Message>(
        &self,
        reply_to: &str,
        response: &Resp,
    ) -> Result<(), AmqpError> {
        let response_type = self.serializer.serialize_type::<Resp>();
        let body = self.serializer.message_to_bytes(response)?;

        let handle = self
            .connection
            .wait_connected(self.config.response_timeout())
            .await?;
        let channel = self.affinity.get_or_create(&handle, &self.channels).await?;
        self.publish_raw(
            &channel,
            DEFAULT_EXCHANGE,
            reply_to,
            MessageProperties::typed(&response_type),
            &body,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    impl Message for Order {
        fn message_type() -> String {
            "Order".to_owned()
        }
    }

    fn delivery(kind: Option<&str>, body: &[u8]) -> Delivery {
        let mut properties = MessageProperties::typed("Order");
        properties.kind = kind.map(str::to_owned);
        Delivery {
            consumer_tag: "tag".to_owned(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "Order".to_owned(),
            routing_key: "orders.created".to_owned(),
            properties,
            body: body.to_vec(),
        }
    }

    #[test]
    fn decodes_messages_carrying_the_expected_type() {
        let order: Order = decode(&JsonSerializer, "Order", &delivery(Some("Order"), br#"{"id":3}"#))
            .unwrap();
        assert_eq!(order, Order { id: 3 });
    }

    #[test]
    fn refuses_other_type_tags_before_parsing() {
        let result: Result<Order, _> =
            decode(&JsonSerializer, "Order", &delivery(Some("Invoice"), b"not json"));
        assert_eq!(
            result,
            Err(AmqpError::TypeMismatch {
                expected: "Order".to_owned(),
                actual: "Invoice".to_owned(),
            })
        );
    }

    #[test]
    fn untyped_messages_are_mismatches() {
        let result: Result<Order, _> = decode(&JsonSerializer, "Order", &delivery(None, br#"{"id":3}"#));
        assert!(matches!(result, Err(AmqpError::TypeMismatch { .. })));
    }
}
