//! Broker topology configuration.
//!
//! One durable queue per gateway instance, bound to a well-known topic
//! exchange. Per-user routing keys are derived from the user identifier so
//! only envelopes relevant to locally connected users reach this instance;
//! the exact names are deployment configuration, not a protocol contract.

use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::registry::UserId;

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection settings.
    pub broker: BrokerConfig,
    /// Exchange inbound envelopes are published to.
    pub exchange: String,
    /// This instance's durable queue.
    pub queue: String,
    /// Routing key prefix for per-user keys (`{prefix}.{user}`).
    pub routing_prefix: String,
    /// When true, an envelope with no matching session is requeued once
    /// before being dropped with a logged loss, instead of acknowledged.
    pub requires_delivery: bool,
    /// Exchange client payloads are republished to.
    pub outbound_exchange: String,
    /// Routing key prefix for republished client payloads.
    pub outbound_prefix: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            exchange: "gateway.events".to_string(),
            queue: "gateway.instance".to_string(),
            routing_prefix: "user".to_string(),
            requires_delivery: false,
            outbound_exchange: "gateway.outbound".to_string(),
            outbound_prefix: "client".to_string(),
        }
    }
}

impl MessagingConfig {
    /// Routing key that delivers envelopes for one user to this instance.
    pub fn user_routing_key(&self, user: &UserId) -> String {
        format!("{}.{}", self.routing_prefix, user)
    }

    /// Routing key for broadcast envelopes.
    pub fn broadcast_routing_key(&self) -> String {
        format!("{}.broadcast", self.routing_prefix)
    }

    /// Routing key for a payload republished on behalf of a user.
    pub fn outbound_routing_key(&self, sender: &UserId) -> String {
        format!("{}.{}", self.outbound_prefix, sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_keys() {
        let config = MessagingConfig::default();
        assert_eq!(
            config.user_routing_key(&UserId::from("alice")),
            "user.alice"
        );
        assert_eq!(config.broadcast_routing_key(), "user.broadcast");
        assert_eq!(
            config.outbound_routing_key(&UserId::from("alice")),
            "client.alice"
        );
    }
}
