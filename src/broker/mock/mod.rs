//! Mock broker link implementation for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{
    AckDecision, BrokerError, BrokerLink, Envelope, EnvelopeHandler, MessageContext, Result,
};

/// A message recorded by the mock on publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub context: MessageContext,
}

/// In-memory broker link for tests.
///
/// Records declared topology and published messages; `deliver` injects an
/// envelope into a subscribed handler and returns its acknowledgment
/// decision so tests can assert on it directly.
#[derive(Default)]
pub struct MockBrokerLink {
    bindings: RwLock<Vec<(String, String, String)>>,
    handlers: RwLock<HashMap<String, Arc<dyn EnvelopeHandler>>>,
    published: RwLock<Vec<PublishedMessage>>,
    fail_on_publish: RwLock<bool>,
}

impl MockBrokerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate broker unavailability on the publish path.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Simulate a dropped broker connection: active subscriptions are
    /// gone, but the declared topology is remembered so a re-subscribe
    /// resumes delivery.
    pub async fn simulate_disconnect(&self) {
        self.handlers.write().await.clear();
    }

    /// Inject a delivery for the handler subscribed to `queue`.
    pub async fn deliver(&self, queue: &str, envelope: Envelope) -> Result<AckDecision> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(queue)
                .cloned()
                .ok_or_else(|| BrokerError::Subscribe(format!("No handler for queue '{}'", queue)))?
        };
        Ok(handler.handle(envelope).await)
    }
}

#[async_trait]
impl BrokerLink for MockBrokerLink {
    async fn declare_and_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        );
        let mut bindings = self.bindings.write().await;
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Box<dyn EnvelopeHandler>) -> Result<()> {
        self.handlers
            .write()
            .await
            .insert(queue.to_string(), Arc::from(handler));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        context: MessageContext,
    ) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BrokerError::Unavailable("Mock publish failure".to_string()));
        }
        self.published.write().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            context,
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.handlers.write().await.clear();
    }
}
