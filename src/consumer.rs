// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch
//!
//! Wraps a channel and a per-delivery callback into a running consumer: it
//! starts `basic_consume`, drives the delivery stream on its own task, opens a
//! trace span per message and maps the callback outcome to an acknowledgment.
//!
//! A failing or panicking callback only fails that delivery; the consume loop
//! keeps going. The loop ends when the channel dies, which is what happens to
//! every consumer when the connection drops.

use crate::{
    broker::{BrokerChannel, Delivery},
    errors::AmqpError,
    otel,
};
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use parking_lot::Mutex;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Callback invoked for every delivery; its result is the completion signal.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<(), AmqpError>> + Send + Sync>;

/// How deliveries are acknowledged.
///
/// The bus always consumes in `Auto` mode. `Manual` serves callers that drive
/// a [`ConsumerFactory`] on a channel of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a message acknowledged once delivered. Handler
    /// failures are logged but the message is not redelivered.
    Auto,
    /// Ack on success, reject without requeue on failure.
    Manual,
}

#[derive(Default)]
pub struct ConsumerFactory {
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConsumerFactory {
    pub fn new() -> ConsumerFactory {
        ConsumerFactory::default()
    }

    /// Starts consuming `queue` on `channel`; returns the consumer tag.
    pub async fn start_consuming(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        ack: AckMode,
        handler: DeliveryHandler,
    ) -> Result<String, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Disposed);
        }

        let tag = Uuid::new_v4().to_string();
        let mut deliveries = channel
            .basic_consume(queue, &tag, ack == AckMode::Auto)
            .await?;
        debug!(queue, consumer_tag = %tag, "consumer started");

        let queue = queue.to_owned();
        let task = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        let delivery_tag = delivery.delivery_tag;
                        let outcome = dispatch(&tracer, delivery, &handler).await;
                        if let Err(err) = complete(channel.as_ref(), delivery_tag, ack, outcome).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!(queue = %queue, "consumer stopped");
        });

        let mut consumers = self.consumers.lock();
        consumers.retain(|c| !c.is_finished());
        consumers.push(task);
        Ok(tag)
    }

    /// Number of consume loops still running.
    pub fn active_consumers(&self) -> usize {
        let mut consumers = self.consumers.lock();
        consumers.retain(|c| !c.is_finished());
        consumers.len()
    }

    /// Stops every consume loop and refuses new consumers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for consumer in self.consumers.lock().drain(..) {
            consumer.abort();
        }
    }
}

async fn dispatch(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &DeliveryHandler,
) -> Result<(), AmqpError> {
    let msg_type = delivery.properties.kind.clone().unwrap_or_default();
    let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &msg_type);

    debug!(
        "received: {} - exchange: {} - redelivered: {}",
        msg_type, delivery.exchange, delivery.redelivered
    );

    let result = match AssertUnwindSafe(handler(delivery)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(AmqpError::HandlerError("handler panicked".to_owned())),
    };

    match &result {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::error(err.to_string()));
        }
    }
    result
}

async fn complete(
    channel: &dyn BrokerChannel,
    delivery_tag: u64,
    ack: AckMode,
    outcome: Result<(), AmqpError>,
) -> Result<(), AmqpError> {
    match (ack, outcome) {
        (AckMode::Auto, Ok(())) => Ok(()),
        (AckMode::Auto, Err(err)) => {
            warn!(error = err.to_string(), "message handling failed");
            Ok(())
        }
        (AckMode::Manual, Ok(())) => channel.basic_ack(delivery_tag).await,
        (AckMode::Manual, Err(err)) => {
            warn!(error = err.to_string(), "message handling failed, rejecting");
            channel.basic_nack(delivery_tag, false).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MessageProperties, MockBrokerChannel};
    use futures_util::stream;
    use mockall::predicate::eq;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    fn delivery(tag: u64, body: &[u8]) -> Delivery {
        Delivery {
            consumer_tag: "tag".to_owned(),
            delivery_tag: tag,
            redelivered: false,
            exchange: "orders".to_owned(),
            routing_key: "orders.created".to_owned(),
            properties: MessageProperties::typed("Order"),
            body: body.to_vec(),
        }
    }

    fn channel_delivering(bodies: Vec<&'static str>, auto_ack: bool) -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_consume()
            .withf(move |queue, _, auto| queue.to_string() == "orders_billing" && *auto == auto_ack)
            .times(1)
            .returning(move |_, _, _| {
                let items: Vec<Result<Delivery, AmqpError>> = bodies
                    .iter()
                    .enumerate()
                    .map(|(i, body)| Ok(delivery(i as u64 + 1, body.as_bytes())))
                    .collect();
                Ok(stream::iter(items).boxed())
            });
        channel
    }

    async fn drained(factory: &ConsumerFactory) {
        for _ in 0..100 {
            if factory.active_consumers() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("consumer did not finish");
    }

    #[tokio::test]
    async fn manual_mode_acks_successes_and_rejects_failures() {
        let mut channel = channel_delivering(vec!["ok", "fail"], false);
        channel
            .expect_basic_ack()
            .with(eq(1))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_basic_nack()
            .with(eq(2), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let factory = ConsumerFactory::new();
        let handler: DeliveryHandler = Arc::new(|delivery: Delivery| {
            async move {
                if delivery.body == b"ok" {
                    Ok(())
                } else {
                    Err(AmqpError::HandlerError("boom".into()))
                }
            }
            .boxed()
        });

        factory
            .start_consuming(Arc::new(channel), "orders_billing", AckMode::Manual, handler)
            .await
            .unwrap();
        drained(&factory).await;
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_stop_the_loop() {
        let channel = channel_delivering(vec!["panic", "ok", "ok"], true);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let counter = counter.clone();
            async move {
                if delivery.body == b"panic" {
                    panic!("handler bug");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), AmqpError>(())
            }
            .boxed()
        });

        let factory = ConsumerFactory::new();
        factory
            .start_consuming(Arc::new(channel), "orders_billing", AckMode::Auto, handler)
            .await
            .unwrap();
        drained(&factory).await;

        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refuses_consumers_after_close() {
        let factory = ConsumerFactory::new();
        factory.close();

        let handler: DeliveryHandler = Arc::new(|_: Delivery| async { Ok::<(), AmqpError>(()) }.boxed());
        let result = factory
            .start_consuming(
                Arc::new(MockBrokerChannel::new()),
                "orders_billing",
                AckMode::Auto,
                handler,
            )
            .await;

        assert_eq!(result, Err(AmqpError::Disposed));
    }
}
