//! Gateway router: the orchestration core.
//!
//! Bridges the broker link and the session registry. Inbound envelopes are
//! resolved to the target user's live sessions and pushed to each; inbound
//! client payloads are republished to the broker for fan-out to other
//! consumers. Failures stay local: one dead socket never blocks delivery
//! to the remaining recipients, and a broker outage surfaces to a client
//! only as a delivery-failed acknowledgment.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::broker::{self, AckDecision, BrokerLink, Envelope, EnvelopeHandler, MessageContext};
use crate::config::MessagingConfig;
use crate::registry::{SessionRegistry, UserId};

pub mod session;

pub use session::{SessionContext, SessionState};

/// The router owns the registry; nothing else mutates it directly.
pub struct GatewayRouter {
    registry: Arc<SessionRegistry>,
    link: Arc<dyn BrokerLink>,
    messaging: MessagingConfig,
}

impl GatewayRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        link: Arc<dyn BrokerLink>,
        messaging: MessagingConfig,
    ) -> Self {
        Self {
            registry,
            link,
            messaging,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Declare the instance queue with its broadcast binding and start the
    /// consumer loop feeding `route_inbound`.
    pub async fn start(self: &Arc<Self>) -> broker::Result<()> {
        self.link
            .declare_and_bind(
                &self.messaging.queue,
                &self.messaging.exchange,
                &self.messaging.broadcast_routing_key(),
            )
            .await?;

        self.link
            .subscribe(
                &self.messaging.queue,
                Box::new(InboundRelay {
                    router: Arc::clone(self),
                }),
            )
            .await?;

        info!(
            queue = %self.messaging.queue,
            exchange = %self.messaging.exchange,
            "Gateway router consuming"
        );
        Ok(())
    }

    /// Bind the instance queue for a newly connected user so the broker
    /// starts routing that user's envelopes here. Idempotent.
    pub async fn bind_user(&self, user: &UserId) -> broker::Result<()> {
        self.link
            .declare_and_bind(
                &self.messaging.queue,
                &self.messaging.exchange,
                &self.messaging.user_routing_key(user),
            )
            .await
    }

    /// Broker -> socket routing.
    ///
    /// An empty recipient set is a normal race between delivery and
    /// disconnect and gets an ack — unless the topology requires delivery,
    /// in which case the envelope is requeued once and then dropped with a
    /// logged loss. Push failures on individual connections are logged and
    /// never fail the fan-out for the rest.
    pub async fn route_inbound(&self, envelope: Envelope) -> AckDecision {
        let recipients = match &envelope.target_user {
            Some(user) => self.registry.lookup_by_user(user).await,
            None => self.registry.all_sessions().await,
        };

        if recipients.is_empty() {
            if envelope.target_user.is_some() && self.messaging.requires_delivery {
                if envelope.redelivered {
                    warn!(
                        routing_key = %envelope.routing_key,
                        delivery_tag = envelope.delivery_tag,
                        "Dropping undeliverable envelope after redelivery"
                    );
                    return AckDecision::Discard;
                }
                debug!(
                    routing_key = %envelope.routing_key,
                    "No local session for required delivery, requeueing"
                );
                return AckDecision::Requeue;
            }
            debug!(
                routing_key = %envelope.routing_key,
                "No local session for envelope, acknowledging"
            );
            return AckDecision::Ack;
        }

        let total = recipients.len();
        let mut delivered = 0usize;
        for handle in &recipients {
            match handle.push(envelope.payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    connection = %handle.connection_id,
                    user = %handle.user_id,
                    error = ?e,
                    "Failed to push envelope to session"
                ),
            }
        }

        debug!(
            routing_key = %envelope.routing_key,
            delivered,
            total,
            "Envelope fan-out complete"
        );
        AckDecision::Ack
    }

    /// Socket -> broker routing: republish a client payload with the
    /// session's user as sender context.
    pub async fn relay_outbound(&self, sender: &UserId, payload: Bytes) -> broker::Result<()> {
        self.link
            .publish(
                &self.messaging.outbound_exchange,
                &self.messaging.outbound_routing_key(sender),
                payload,
                MessageContext::from_sender(sender.clone()),
            )
            .await
    }
}

/// Adapter feeding broker deliveries into the router.
struct InboundRelay {
    router: Arc<GatewayRouter>,
}

impl EnvelopeHandler for InboundRelay {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, AckDecision> {
        let router = Arc::clone(&self.router);
        Box::pin(async move { router.route_inbound(envelope).await })
    }
}
