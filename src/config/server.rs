//! HTTP/WebSocket server configuration.

use std::time::Duration;

use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (HTTP admission API and WebSocket upgrade share it).
    pub port: u16,
    /// Bound per-session outbound send queue; when full, new pushes for
    /// that session are dropped rather than blocking the broker consumer.
    pub send_queue: usize,
    /// Seconds a new socket gets to present its auth token.
    pub handshake_timeout_secs: u64,
    /// Seconds a closing session gets to drain pending outbound sends.
    pub drain_timeout_secs: u64,
    /// Ping interval for connection liveness.
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            send_queue: 64,
            handshake_timeout_secs: 10,
            drain_timeout_secs: 5,
            heartbeat_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
    }
}
