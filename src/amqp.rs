// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Broker Implementation
//!
//! Implements the broker seam with `lapin`. Connection loss is observed through
//! lapin's error callback and turned into the [`BrokerConnection::closed`]
//! signal the reconnect loop waits on. Lapin errors caused by a dead channel or
//! connection are mapped to [`AmqpError::OperationInterrupted`] so the bus can
//! treat them as transient.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
        MessageProperties,
    },
    config::BusConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Opens lapin connections using the credentials of a [`BusConfig`].
pub struct AmqpConnector {
    uri: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(cfg: &BusConfig) -> AmqpConnector {
        AmqpConnector {
            uri: cfg.amqp_uri(),
            connection_name: cfg.connection_name.clone(),
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let lost = Arc::new(watch::Sender::new(false));
        let on_error = lost.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            on_error.send_replace(true);
        });

        Ok(Arc::new(AmqpConnection { conn, lost }))
    }
}

/// A lapin connection plus the flag raised when lapin reports its loss.
pub struct AmqpConnection {
    conn: Connection,
    lost: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(AmqpChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(classify(&err, |_| AmqpError::ChannelError))
            }
        }
    }

    async fn closed(&self) {
        let mut lost = self.lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = if self.conn.status().connected() {
            self.conn
                .close(200, "closing")
                .await
                .map_err(|err| classify(&err, AmqpError::ConnectionError))
        } else {
            Ok(())
        };
        self.lost.send_replace(true);
        result
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected() && !*self.lost.borrow()
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                classify(&err, AmqpError::QoSDeclarationError)
            })
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(classify(&err, |_| {
                    AmqpError::DeclareExchangeError(def.name.clone())
                }))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(classify(&err, |_| AmqpError::DeclareQueueError(def.name.clone())))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                classify(&err, |_| {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(&properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(classify(&err, AmqpError::PublishingError))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(classify(&err, |_| {
                    AmqpError::BindingConsumerError(queue.to_owned())
                }))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Delivery {
                    consumer_tag: tag.clone(),
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    properties: from_basic_properties(&delivery.properties),
                    body: delivery.data,
                }),
                Err(err) => Err(classify(&err, AmqpError::ConsumerError)),
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "closing")
            .await
            .map_err(|err| classify(&err, |_| AmqpError::ChannelError))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// Maps a lapin error to the bus taxonomy, flagging dead-connection errors as
/// interrupted operations.
fn classify(err: &lapin::Error, fallback: impl FnOnce(String) -> AmqpError) -> AmqpError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => AmqpError::OperationInterrupted(err.to_string()),
        _ => fallback(err.to_string()),
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    let mut basic = BasicProperties::default().with_headers(FieldTable::from(headers));
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(message_id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    basic
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .filter_map(|(key, value)| match value {
                AMQPValue::LongString(v) => Some((
                    key.to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )),
                AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
                _ => None,
            })
            .collect(),
        None => BTreeMap::default(),
    };

    MessageProperties {
        kind: props.kind().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        headers,
    }
}
