//! relay-gateway - Real-time message gateway
//!
//! Bridges a topic-based AMQP broker to live per-user WebSocket sessions.
//! Inbound broker envelopes are fanned out to the live sessions of their
//! target user; inbound socket messages are republished to the broker.
//! Session admission is gated by an HTTP authentication handshake that
//! exchanges a provider credential for a one-time session token.

pub mod auth;
pub mod broker;
pub mod config;
pub mod http;
pub mod registry;
pub mod router;
pub mod utils;
