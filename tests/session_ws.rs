//! Socket session tests against a live server with a real WebSocket
//! client: in-band handshake, bidirectional relay, and teardown on both
//! client close and service shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_gateway::auth::{AuthError, CredentialVerifier, TokenStore, VerifierRegistry};
use relay_gateway::broker::mock::MockBrokerLink;
use relay_gateway::broker::Envelope;
use relay_gateway::config::{MessagingConfig, ServerConfig};
use relay_gateway::http::{build_router, AppState};
use relay_gateway::registry::{SessionRegistry, UserId};
use relay_gateway::router::{GatewayRouter, SessionContext};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct StaticVerifier;

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    fn provider(&self) -> &'static str {
        "static"
    }

    async fn verify(&self, credential: &str) -> relay_gateway::auth::Result<UserId> {
        if credential == "good" {
            Ok(UserId::from("alice"))
        } else {
            Err(AuthError::InvalidCredential)
        }
    }
}

struct Gateway {
    ws_url: String,
    link: Arc<MockBrokerLink>,
    registry: Arc<SessionRegistry>,
    tokens: Arc<TokenStore>,
    messaging: MessagingConfig,
    shutdown: watch::Sender<bool>,
}

/// Boot the full stack on an ephemeral port over the mock broker link
/// and return handles the tests drive it with.
async fn boot_gateway() -> Gateway {
    let link = Arc::new(MockBrokerLink::new());
    let registry = Arc::new(SessionRegistry::new());
    let messaging = MessagingConfig::default();
    let router = Arc::new(GatewayRouter::new(
        Arc::clone(&registry),
        Arc::clone(&link) as Arc<dyn relay_gateway::broker::BrokerLink>,
        messaging.clone(),
    ));
    router.start().await.unwrap();

    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let mut verifiers = VerifierRegistry::new(1);
    verifiers.register(Arc::new(StaticVerifier));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ServerConfig {
        drain_timeout_secs: 1,
        ..Default::default()
    };

    let state = AppState {
        verifiers: Arc::new(verifiers),
        tokens: Arc::clone(&tokens),
        session: Arc::new(SessionContext {
            tokens: Arc::clone(&tokens),
            router,
            server,
            shutdown: shutdown_rx,
        }),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Gateway {
        ws_url: format!("ws://{addr}/ws"),
        link,
        registry,
        tokens,
        messaging,
        shutdown: shutdown_tx,
    }
}

/// Open a socket, present a freshly minted token, and wait for the
/// server's connected event.
async fn connect_session(gw: &Gateway, user: &str) -> WsStream {
    let token = gw.tokens.issue(UserId::from(user)).await;
    let (mut ws, _) = connect_async(gw.ws_url.as_str()).await.unwrap();
    ws.send(Message::text(json!({ "token": token }).to_string()))
        .await
        .unwrap();
    let event: Value = serde_json::from_str(&read_text(&mut ws).await).unwrap();
    assert_eq!(event["event"], "connected");
    ws
}

async fn read_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

async fn read_binary(ws: &mut WsStream) -> Vec<u8> {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Binary(payload) = msg {
            return payload.to_vec();
        }
    }
}

/// Read until the server closes the connection; panics if it stays open.
async fn expect_closed(ws: &mut WsStream) {
    loop {
        match timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    }
}

async fn wait_for_published(gw: &Gateway, count: usize) {
    timeout(TIMEOUT, async {
        while gw.link.published_count().await < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for publish");
}

/// Handshake, inbound delivery as a binary frame, and a SendMessage
/// event republished on the outbound exchange.
#[tokio::test]
async fn test_session_relays_both_directions() {
    let gw = boot_gateway().await;
    let mut ws = connect_session(&gw, "alice").await;
    assert_eq!(gw.registry.len().await, 1);

    let alice = UserId::from("alice");
    gw.link
        .deliver(
            &gw.messaging.queue,
            Envelope {
                target_user: Some(alice.clone()),
                routing_key: gw.messaging.user_routing_key(&alice),
                payload: bytes::Bytes::from_static(b"inbound"),
                delivery_tag: 1,
                redelivered: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(read_binary(&mut ws).await, b"inbound");

    ws.send(Message::text(
        json!({ "event": "SendMessage", "data": { "text": "hi" } }).to_string(),
    ))
    .await
    .unwrap();
    wait_for_published(&gw, 1).await;
    let published = gw.link.take_published().await;
    assert_eq!(published[0].routing_key, gw.messaging.outbound_routing_key(&alice));
}

/// A bad token is refused before the registry is ever touched.
#[tokio::test]
async fn test_invalid_token_closes_without_session() {
    let gw = boot_gateway().await;
    let (mut ws, _) = connect_async(gw.ws_url.as_str()).await.unwrap();
    ws.send(Message::text(json!({ "token": "forged" }).to_string()))
        .await
        .unwrap();

    expect_closed(&mut ws).await;
    assert_eq!(gw.registry.len().await, 0);
}

/// A client-initiated close removes the session.
#[tokio::test]
async fn test_client_close_removes_session() {
    let gw = boot_gateway().await;
    let mut ws = connect_session(&gw, "alice").await;
    assert_eq!(gw.registry.len().await, 1);

    ws.close(None).await.unwrap();
    timeout(TIMEOUT, async {
        while gw.registry.len().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session not removed after client close");
}

/// Service shutdown closes the session end to end: the client sees the
/// connection drop, the registry empties, and frames the client sends
/// afterwards are never relayed to the broker.
#[tokio::test]
async fn test_shutdown_stops_relaying_client_frames() {
    let gw = boot_gateway().await;
    let mut ws = connect_session(&gw, "alice").await;

    ws.send(Message::text(
        json!({ "event": "SendMessage", "data": { "text": "before" } }).to_string(),
    ))
    .await
    .unwrap();
    wait_for_published(&gw, 1).await;

    gw.shutdown.send(true).unwrap();
    expect_closed(&mut ws).await;
    timeout(TIMEOUT, async {
        while gw.registry.len().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session not removed after shutdown");

    // The client keeps talking into the dead session; nothing may reach
    // the broker because the reader is gone along with the writer.
    let _ = ws
        .send(Message::text(
            json!({ "event": "SendMessage", "data": { "text": "after" } }).to_string(),
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.link.published_count().await, 1);
}
