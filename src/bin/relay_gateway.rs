//! relay-gateway: real-time message gateway
//!
//! Bridges a topic-based AMQP broker to live per-user WebSocket sessions.
//!
//! ```text
//! [AMQP Broker] <-> [relay-gateway] <-> [WebSocket Clients]
//!                         ^
//!                         |
//!                  [Identity Providers]
//! ```
//!
//! ## Configuration
//! - RELAY_GATEWAY_CONFIG: configuration file path (default: gateway.yaml)
//! - RELAY_GATEWAY_LOG: log filter (default: "info")
//! - RELAY_GATEWAY__* environment overrides (e.g. RELAY_GATEWAY__SERVER__PORT)

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use relay_gateway::auth::{TokenStore, VerifierRegistry};
use relay_gateway::broker::BrokerLink;
use relay_gateway::config::Config;
use relay_gateway::http::{build_router, AppState};
use relay_gateway::registry::SessionRegistry;
use relay_gateway::router::{GatewayRouter, SessionContext};
use relay_gateway::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting relay-gateway");

    let tokens = Arc::new(TokenStore::new(config.auth.token_ttl()));
    let verifiers = Arc::new(VerifierRegistry::from_config(&config.auth));
    info!(providers = ?verifiers.providers(), "Identity providers registered");

    let link = broker_link(&config).await?;
    let registry = Arc::new(SessionRegistry::new());
    let router = Arc::new(GatewayRouter::new(
        Arc::clone(&registry),
        Arc::clone(&link),
        config.messaging.clone(),
    ));
    router.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        verifiers,
        tokens: Arc::clone(&tokens),
        session: Arc::new(SessionContext {
            tokens,
            router: Arc::clone(&router),
            server: config.server.clone(),
            shutdown: shutdown_rx.clone(),
        }),
    };

    let app = build_router(state);
    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, draining sessions");
            let _ = signal_tx.send(true);
        }
    });

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;

    // Sessions saw the shutdown signal and are draining their queues; give
    // them the configured flush window before the broker link goes away.
    tokio::time::sleep(config.server.drain_timeout()).await;
    let drained = registry.drain().await;
    if !drained.is_empty() {
        warn!(sessions = drained.len(), "Closed with sessions still registered");
    }
    link.shutdown().await;
    info!("Gateway stopped");

    Ok(())
}

#[cfg(feature = "amqp")]
async fn broker_link(config: &Config) -> Result<Arc<dyn BrokerLink>, Box<dyn std::error::Error>> {
    use backon::Retryable;
    use relay_gateway::broker::amqp::AmqpBrokerLink;
    use relay_gateway::utils::retry::connection_backoff;

    let broker = config.messaging.broker.clone();
    let link = (|| AmqpBrokerLink::connect(broker.clone()))
        .retry(connection_backoff())
        .notify(|e, dur| {
            warn!(error = %e, retry_in_ms = %dur.as_millis(), "Broker connect failed, retrying");
        })
        .await?;
    info!(url = %config.messaging.broker.url, "Connected to broker");
    Ok(Arc::new(link))
}

#[cfg(not(feature = "amqp"))]
async fn broker_link(_config: &Config) -> Result<Arc<dyn BrokerLink>, Box<dyn std::error::Error>> {
    use relay_gateway::broker::mock::MockBrokerLink;

    warn!("Built without the amqp feature, using the in-process mock link");
    Ok(Arc::new(MockBrokerLink::new()))
}
