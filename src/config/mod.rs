//! Application configuration.
//!
//! Aggregates configuration for the server, messaging topology, and auth
//! providers into a single `Config` loadable from a YAML file or
//! environment variables.

mod auth;
mod messaging;
mod server;

pub use auth::{
    AuthConfig, FacebookProviderConfig, GoogleProviderConfig, TruecallerProviderConfig,
};
pub use messaging::MessagingConfig;
pub use server::ServerConfig;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "gateway.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAY_GATEWAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAY_GATEWAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAY_GATEWAY_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP/WebSocket server configuration.
    pub server: ServerConfig,
    /// Broker connection and topology configuration.
    pub messaging: MessagingConfig,
    /// Identity provider and session token configuration.
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (later overrides earlier):
    /// 1. `gateway.yaml` in the current directory (if present)
    /// 2. File specified by the `path` argument (if provided)
    /// 3. File specified by `RELAY_GATEWAY_CONFIG` (if set)
    /// 4. Environment variables with the `RELAY_GATEWAY` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.messaging.broker.url, "amqp://localhost:5672");
        assert!(config.auth.google.enabled);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.server.host, "0.0.0.0");
    }
}
