//! HTTP surface: admission handshake, socket upgrade, health.
//!
//! Admission is a two-step flow. A client first POSTs a provider
//! credential to `/auth/{provider}`; a verified credential mints a
//! short-lived one-time session token. The client then opens `/ws` and
//! presents that token as its first frame, which the session worker
//! redeems before the session is registered.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{AuthError, TokenStore, VerifierRegistry};
use crate::router::SessionContext;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub verifiers: Arc<VerifierRegistry>,
    pub tokens: Arc<TokenStore>,
    pub session: Arc<SessionContext>,
}

#[derive(Deserialize)]
struct AuthRequest {
    credential: String,
}

/// Build the router with all routes and layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/{provider}", post(authenticate))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Verify a provider credential and mint a one-time session token.
async fn authenticate(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<AuthRequest>,
) -> impl IntoResponse {
    if state.verifiers.get(&provider).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown provider" })),
        );
    }

    match state
        .verifiers
        .verify_with_retry(&provider, &request.credential)
        .await
    {
        Ok(user_id) => {
            let token = state.tokens.issue(user_id.clone()).await;
            info!(provider, user = %user_id, "Credential verified, token issued");
            (StatusCode::OK, Json(json!({ "token": token })))
        }
        Err(AuthError::InvalidCredential) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credential" })),
        ),
        Err(AuthError::ProviderUnavailable(reason)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("identity provider unavailable: {reason}") })),
        ),
    }
}

/// Upgrade to a socket session; authentication happens in-band as the
/// session's first frame.
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::router::session::run(socket, state.session))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.session.router.registry().len().await;
    Json(json!({ "status": "healthy", "sessions": sessions }))
}
