//! Broker link: publish/subscribe transport abstraction.
//!
//! This module contains:
//! - `BrokerLink` trait: topology setup, subscribe-with-callback, publish
//! - `EnvelopeHandler` trait: per-delivery processing with an explicit
//!   acknowledgment decision
//! - `Envelope`: the unit exchanged between the broker and the router
//! - Implementations: AMQP (RabbitMQ), Mock

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::registry::UserId;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBrokerLink;
pub use mock::MockBrokerLink;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Endpoint unreachable or connection lost; retryable by the caller.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("topology setup failed: {0}")]
    Topology(String),
}

/// Acknowledgment decision returned by an envelope handler.
///
/// The decision is explicit rather than implied by whether the handler
/// faulted, so "handler failed" and "handler chose not to retry" stay
/// distinguishable. Every delivery is acked or nacked exactly once by the
/// consumer loop based on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Done with the message; acknowledge it.
    Ack,
    /// Put the message back on the queue for redelivery.
    Requeue,
    /// Reject without redelivery.
    Discard,
}

/// Message header carrying the intended recipient of an envelope.
pub const TARGET_USER_HEADER: &str = "target-user";
/// Message header carrying the originating user of a republished payload.
pub const SENDER_USER_HEADER: &str = "sender-user";

/// The unit exchanged between the broker link and the gateway router.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Intended recipient; absent for broadcast envelopes.
    pub target_user: Option<UserId>,
    /// Broker-level routing key the message was delivered under.
    pub routing_key: String,
    /// Opaque payload; never interpreted by the gateway core.
    pub payload: Bytes,
    /// Broker-assigned delivery tag, used for acknowledgment.
    pub delivery_tag: u64,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
}

/// Sender/recipient context attached to a published message as headers.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub sender: Option<UserId>,
    pub target: Option<UserId>,
}

impl MessageContext {
    pub fn from_sender(sender: UserId) -> Self {
        Self {
            sender: Some(sender),
            target: None,
        }
    }

    pub fn for_target(target: UserId) -> Self {
        Self {
            sender: None,
            target: Some(target),
        }
    }
}

/// Handler invoked once per delivered envelope.
pub trait EnvelopeHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, AckDecision>;
}

/// Interface to the publish/subscribe transport.
///
/// Implementations:
/// - `AmqpBrokerLink`: RabbitMQ via AMQP, with automatic reconnection
/// - `MockBrokerLink`: in-memory mock for testing
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Idempotent topology setup: declare the queue and exchange and bind
    /// them under the routing key. Bindings are remembered and re-asserted
    /// after a reconnect, so subscribers observe at most a delivery pause.
    async fn declare_and_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()>;

    /// Start consuming from a queue. The handler is invoked once per
    /// delivery and its decision drives the ack/nack.
    async fn subscribe(&self, queue: &str, handler: Box<dyn EnvelopeHandler>) -> Result<()>;

    /// Publish a payload to an exchange. Fails with `Unavailable` when the
    /// broker cannot be reached; callers must treat that as retryable.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        context: MessageContext,
    ) -> Result<()>;

    /// Stop accepting new deliveries and close the connection. In-flight
    /// acknowledgments finish first.
    async fn shutdown(&self);
}

/// AMQP link configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Connection pool size.
    pub pool_size: usize,
    /// Maximum publish attempts before surfacing `Unavailable`.
    pub publish_max_retries: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
            publish_max_retries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.url, "amqp://localhost:5672");
        assert_eq!(config.publish_max_retries, 5);
    }

    #[test]
    fn test_message_context_constructors() {
        let ctx = MessageContext::from_sender(UserId::from("alice"));
        assert_eq!(ctx.sender, Some(UserId::from("alice")));
        assert!(ctx.target.is_none());

        let ctx = MessageContext::for_target(UserId::from("bob"));
        assert_eq!(ctx.target, Some(UserId::from("bob")));
        assert!(ctx.sender.is_none());
    }
}
