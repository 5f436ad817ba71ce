//! AMQP (RabbitMQ) broker link implementation.
//!
//! Uses a topic exchange to route envelopes to gateway instance queues.
//! Consumer loops reconnect automatically and re-assert queue/exchange
//! bindings before resuming delivery, so a broker drop is visible to
//! sessions only as a delivery pause.

use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    AckDecision, BrokerConfig, BrokerError, BrokerLink, Envelope, EnvelopeHandler,
    MessageContext, Result, SENDER_USER_HEADER, TARGET_USER_HEADER,
};
use crate::registry::UserId;

/// One remembered queue/exchange binding, re-asserted on reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

/// AMQP broker link backed by a lapin connection pool.
pub struct AmqpBrokerLink {
    pool: Pool,
    config: BrokerConfig,
    bindings: Arc<RwLock<Vec<Binding>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl AmqpBrokerLink {
    /// Connect to the broker and verify the connection.
    ///
    /// Fails with `Unavailable` if the endpoint cannot be reached.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create pool: {}", e)))?;

        // Verify connectivity before reporting success.
        let conn = pool
            .get()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to connect: {}", e)))?;
        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create channel: {}", e)))?;

        info!(url = %config.url, "Connected to AMQP broker");

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            pool,
            config,
            bindings: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
        })
    }

    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Unavailable(format!("Failed to get connection from pool: {}", e))
        })?;
        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create channel: {}", e)))
    }

    /// Declare topology for a single binding on the given channel.
    async fn assert_binding(channel: &Channel, binding: &Binding) -> Result<()> {
        channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange: {}", e)))?;

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind queue: {}", e)))?;

        Ok(())
    }

    /// Consumer loop with automatic reconnection and backoff with jitter.
    ///
    /// Re-asserts every remembered binding for the queue before each
    /// consume so delivery resumes with the same topology after a drop.
    async fn consume_with_reconnect(
        pool: Pool,
        queue: String,
        bindings: Arc<RwLock<Vec<Binding>>>,
        handler: Arc<dyn EnvelopeHandler>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        use futures::StreamExt;
        use std::time::Duration;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            if *shutdown_rx.borrow() {
                info!(queue = %queue, "Consumer stopped by shutdown");
                return;
            }

            match Self::setup_consumer(&pool, &queue, &bindings).await {
                Ok(mut consumer) => {
                    info!(queue = %queue, "Consumer connected, processing deliveries");
                    // Reset backoff on successful connection.
                    backoff_iter = backoff_builder.build();

                    loop {
                        tokio::select! {
                            delivery = consumer.next() => match delivery {
                                Some(Ok(delivery)) => {
                                    Self::process_delivery(delivery, &handler).await;
                                }
                                Some(Err(e)) => {
                                    error!(error = %e, "Consumer delivery error, will reconnect");
                                    break;
                                }
                                None => {
                                    info!(queue = %queue, "Consumer stream ended, reconnecting");
                                    break;
                                }
                            },
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    info!(queue = %queue, "Consumer shutting down");
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Set up consumer channel, re-assert bindings, start consuming.
    async fn setup_consumer(
        pool: &Pool,
        queue: &str,
        bindings: &Arc<RwLock<Vec<Binding>>>,
    ) -> Result<lapin::Consumer> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BrokerError::Unavailable(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create channel: {}", e)))?;

        let remembered = bindings.read().await.clone();
        for binding in remembered.iter().filter(|b| b.queue == queue) {
            Self::assert_binding(&channel, binding).await?;
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Re-asserted binding"
            );
        }

        let consumer = channel
            .basic_consume(
                queue,
                "relay-gateway",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer)
    }

    /// Process a single delivery: build the envelope, run the handler, and
    /// settle the delivery exactly once according to its decision.
    async fn process_delivery(
        delivery: lapin::message::Delivery,
        handler: &Arc<dyn EnvelopeHandler>,
    ) {
        // The acker settles independently of the payload, so the body
        // moves into the envelope without a copy.
        let lapin::message::Delivery {
            delivery_tag,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
            ..
        } = delivery;

        let envelope = Envelope {
            target_user: header_user(&properties, TARGET_USER_HEADER),
            routing_key: routing_key.to_string(),
            payload: Bytes::from(data),
            delivery_tag,
            redelivered,
        };

        debug!(
            routing_key = %envelope.routing_key,
            delivery_tag = envelope.delivery_tag,
            redelivered = envelope.redelivered,
            "Received envelope"
        );

        let decision = handler.handle(envelope).await;
        let settle = match decision {
            AckDecision::Ack => acker.ack(BasicAckOptions::default()).await,
            AckDecision::Requeue => {
                acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
            AckDecision::Discard => {
                acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
            }
        };

        if let Err(e) = settle {
            error!(error = %e, decision = ?decision, "Failed to settle delivery");
        }
    }
}

#[async_trait]
impl BrokerLink for AmqpBrokerLink {
    async fn declare_and_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };

        // Remember the binding before asserting it: if the broker is down
        // right now, the consumer reconnect loop re-asserts it later.
        {
            let mut bindings = self.bindings.write().await;
            if !bindings.contains(&binding) {
                bindings.push(binding.clone());
            }
        }

        let channel = self.get_channel().await?;
        Self::assert_binding(&channel, &binding).await?;

        info!(
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Box<dyn EnvelopeHandler>) -> Result<()> {
        let known = self.bindings.read().await.iter().any(|b| b.queue == queue);
        if !known {
            return Err(BrokerError::Subscribe(format!(
                "No binding declared for queue '{}'; call declare_and_bind first",
                queue
            )));
        }

        let pool = self.pool.clone();
        let bindings = Arc::clone(&self.bindings);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let queue = queue.to_string();
        let handler: Arc<dyn EnvelopeHandler> = Arc::from(handler);

        tokio::spawn(async move {
            Self::consume_with_reconnect(pool, queue, bindings, handler, shutdown_rx).await;
        });

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        context: MessageContext,
    ) -> Result<()> {
        use std::time::Duration;

        let max_retries = self.config.publish_max_retries;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(max_retries)
            .with_jitter()
            .build();

        let properties = BasicProperties::default()
            .with_content_type("application/octet-stream".into())
            .with_delivery_mode(2) // persistent
            .with_headers(context_headers(&context));

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel for each attempt (handles reconnection).
            let channel = match self.get_channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "Failed to get channel, retrying"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            match channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties.clone(),
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(
                            exchange = %exchange,
                            routing_key = %routing_key,
                            "Published payload"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            error = %e,
                            "Publish confirmation failed, retrying"
                        );
                        last_error = Some(BrokerError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    last_error = Some(BrokerError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::Unavailable("Max publish retries exceeded".into())))
    }

    async fn shutdown(&self) {
        // Consumers observe the flag, stop taking deliveries, and finish
        // settling in-flight ones before their tasks return.
        let _ = self.shutdown_tx.send(true);
    }
}

fn context_headers(context: &MessageContext) -> FieldTable {
    let mut headers = std::collections::BTreeMap::new();
    if let Some(sender) = &context.sender {
        headers.insert(
            SENDER_USER_HEADER.into(),
            AMQPValue::LongString(sender.as_str().into()),
        );
    }
    if let Some(target) = &context.target {
        headers.insert(
            TARGET_USER_HEADER.into(),
            AMQPValue::LongString(target.as_str().into()),
        );
    }
    FieldTable::from(headers)
}

fn header_user(properties: &BasicProperties, name: &str) -> Option<UserId> {
    properties.headers().as_ref().and_then(|headers| {
        headers.inner().get(name).and_then(|v| match v {
            AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
                .ok()
                .map(UserId::from),
            _ => None,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_headers_roundtrip() {
        let context = MessageContext {
            sender: Some(UserId::from("alice")),
            target: Some(UserId::from("bob")),
        };
        let properties = BasicProperties::default().with_headers(context_headers(&context));

        assert_eq!(
            header_user(&properties, SENDER_USER_HEADER),
            Some(UserId::from("alice"))
        );
        assert_eq!(
            header_user(&properties, TARGET_USER_HEADER),
            Some(UserId::from("bob"))
        );
    }

    #[test]
    fn test_missing_headers_mean_broadcast() {
        let properties = BasicProperties::default();
        assert_eq!(header_user(&properties, TARGET_USER_HEADER), None);
    }
}
