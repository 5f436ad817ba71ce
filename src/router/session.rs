//! Per-session lifecycle.
//!
//! One logical worker per live socket session. The session moves through
//! `Connecting -> Authenticated -> Active -> Closing -> Closed`; relay
//! happens only in `Active`. The first client frame must be the auth
//! handshake (`{"token": ...}`), redeeming a one-time token minted by the
//! HTTP admission API. On a refused credential the registry is never
//! touched.
//!
//! Wire shape once active: binary frames carry opaque relayed payloads in
//! both directions; text frames carry JSON control events with an `event`
//! field (client "SendMessage", server "connected"/"DeliveryFailed").

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::auth::TokenStore;
use crate::config::ServerConfig;
use crate::registry::{ConnectionId, SessionHandle, SessionMessage, UserId};
use crate::router::GatewayRouter;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, no verified identity yet.
    Connecting,
    /// Credential verified; registry entry about to be created.
    Authenticated,
    /// Relaying in both directions.
    Active,
    /// Draining in-flight outbound sends, bounded by the flush timeout.
    Closing,
    /// Terminal; registry entry removed.
    Closed,
}

/// Everything a session worker needs, shared across sessions.
pub struct SessionContext {
    pub tokens: Arc<TokenStore>,
    pub router: Arc<GatewayRouter>,
    pub server: ServerConfig,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Deserialize)]
struct HandshakeFrame {
    token: String,
}

#[derive(Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn parse_handshake(raw: &str) -> Option<String> {
    serde_json::from_str::<HandshakeFrame>(raw)
        .ok()
        .map(|f| f.token)
}

fn connected_event(connection_id: &ConnectionId) -> String {
    serde_json::json!({
        "event": "connected",
        "connectionId": connection_id.as_str(),
    })
    .to_string()
}

fn delivery_failed_event() -> String {
    serde_json::json!({ "event": "DeliveryFailed" }).to_string()
}

fn transition(connection: &ConnectionId, state: &mut SessionState, next: SessionState) {
    debug!(connection = %connection, from = ?state, to = ?next, "Session state");
    *state = next;
}

/// Drive one socket session from upgrade to teardown.
pub async fn run(mut socket: WebSocket, ctx: Arc<SessionContext>) {
    let connection_id = ConnectionId::generate();
    let mut state = SessionState::Connecting;

    let user_id = match handshake(&mut socket, &ctx).await {
        Ok(user) => user,
        Err(reason) => {
            // Terminal for this attempt; the registry is never touched.
            info!(connection = %connection_id, reason, "Refusing connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };
    transition(&connection_id, &mut state, SessionState::Authenticated);

    let (tx, rx) = mpsc::channel(ctx.server.send_queue);
    let handle = match ctx
        .router
        .registry()
        .add(SessionHandle::new(
            connection_id.clone(),
            user_id.clone(),
            tx,
        ))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Session registration failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // Route this user's envelopes to the instance queue. If the broker is
    // briefly down the binding is remembered and re-asserted on reconnect.
    if let Err(e) = ctx.router.bind_user(&user_id).await {
        warn!(user = %user_id, error = %e, "User binding deferred to broker reconnect");
    }

    transition(&connection_id, &mut state, SessionState::Active);
    info!(connection = %connection_id, user = %user_id, "Session active");

    if socket
        .send(Message::Text(connected_event(&connection_id).into()))
        .await
        .is_err()
    {
        transition(&connection_id, &mut state, SessionState::Closed);
        ctx.router.registry().remove(&connection_id).await;
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        Arc::clone(&ctx),
        connection_id.clone(),
    ));
    let mut reader = tokio::spawn(read_loop(ws_rx, Arc::clone(&ctx), Arc::clone(&handle)));

    // Either half ending (client close, transport error, or shutdown
    // signal through the writer) tears the session down. The surviving
    // half is aborted so a shutdown-closed session stops relaying client
    // frames immediately instead of when the client hangs up.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    transition(&connection_id, &mut state, SessionState::Closing);
    // Removal is unconditional and idempotent; dropping the registry entry
    // closes the outbound channel, which ends the writer after its drain.
    ctx.router.registry().remove(&connection_id).await;
    transition(&connection_id, &mut state, SessionState::Closed);
    info!(connection = %connection_id, user = %user_id, "Session closed");
}

async fn handshake(socket: &mut WebSocket, ctx: &SessionContext) -> Result<UserId, &'static str> {
    let frame = tokio::time::timeout(ctx.server.handshake_timeout(), socket.recv()).await;
    let msg = match frame {
        Ok(Some(Ok(msg))) => msg,
        Ok(_) => return Err("socket closed during handshake"),
        Err(_) => return Err("handshake timed out"),
    };
    let text = match msg {
        Message::Text(text) => text,
        _ => return Err("expected text handshake frame"),
    };
    let token = parse_handshake(text.as_str()).ok_or("malformed handshake frame")?;
    ctx.tokens
        .redeem(&token)
        .await
        .map_err(|_| "invalid credential")
}

/// Writer half: preserves per-connection send order, pings for liveness,
/// and on shutdown drains pending sends bounded by the flush timeout.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<SessionMessage>,
    ctx: Arc<SessionContext>,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(ctx.server.heartbeat_interval());
    ping.tick().await; // consume the immediate first tick
    let mut shutdown = ctx.shutdown.clone();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(m) => {
                    if ws_tx.send(to_ws_message(m)).await.is_err() {
                        return;
                    }
                }
                // Channel closed by registry removal: nothing left to drain.
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
                debug!(connection = %connection_id, "Sent ping");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Closing: best-effort drain of already queued sends.
    let drain = async {
        while let Ok(m) = rx.try_recv() {
            if ws_tx.send(to_ws_message(m)).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    };
    if tokio::time::timeout(ctx.server.drain_timeout(), drain)
        .await
        .is_err()
    {
        warn!(connection = %connection_id, "Drain timed out, forcing close");
    }
}

fn to_ws_message(message: SessionMessage) -> Message {
    match message {
        SessionMessage::Payload(payload) => Message::Binary(payload),
        SessionMessage::Event(event) => Message::Text(event.into()),
    }
}

/// Reader half: relays client payloads to the broker.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    ctx: Arc<SessionContext>,
    handle: Arc<SessionHandle>,
) {
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => handle_client_frame(&ctx, &handle, text.as_str()).await,
            Message::Binary(payload) => relay(&ctx, &handle, payload).await,
            Message::Close(_) => break,
            // axum answers pings automatically
            _ => {}
        }
    }
}

async fn handle_client_frame(ctx: &SessionContext, handle: &SessionHandle, raw: &str) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %handle.connection_id, error = %e, "Ignoring malformed client frame");
            return;
        }
    };
    match frame.event.as_str() {
        "SendMessage" => {
            let payload = Bytes::from(frame.data.to_string());
            relay(ctx, handle, payload).await;
        }
        other => {
            warn!(connection = %handle.connection_id, event = other, "Ignoring unknown client event");
        }
    }
}

async fn relay(ctx: &SessionContext, handle: &SessionHandle, payload: Bytes) {
    if let Err(e) = ctx.router.relay_outbound(&handle.user_id, payload).await {
        // Surfaced to the client, never silently dropped.
        warn!(
            connection = %handle.connection_id,
            user = %handle.user_id,
            error = %e,
            "Republish failed, notifying client"
        );
        let _ = handle.notify(delivery_failed_event());
    }
}
