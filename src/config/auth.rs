//! Identity provider and session token configuration.

use std::time::Duration;

use serde::Deserialize;

/// Auth configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub google: GoogleProviderConfig,
    pub facebook: FacebookProviderConfig,
    pub truecaller: TruecallerProviderConfig,
    /// Session token time-to-live in seconds.
    pub token_ttl_secs: u64,
    /// Maximum verification attempts when a provider is unavailable.
    pub verify_max_attempts: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            google: GoogleProviderConfig::default(),
            facebook: FacebookProviderConfig::default(),
            truecaller: TruecallerProviderConfig::default(),
            token_ttl_secs: 300,
            verify_max_attempts: 3,
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoogleProviderConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for GoogleProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://oauth2.googleapis.com/tokeninfo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FacebookProviderConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub app_id: String,
    pub app_secret: String,
}

impl Default for FacebookProviderConfig {
    fn default() -> Self {
        Self {
            // Requires app credentials, so off until configured.
            enabled: false,
            endpoint: "https://graph.facebook.com/debug_token".to_string(),
            app_id: String::new(),
            app_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TruecallerProviderConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for TruecallerProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://profile4-noneu.truecaller.com/v1/default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_defaults() {
        let config = AuthConfig::default();
        assert!(config.google.enabled);
        assert!(!config.facebook.enabled);
        assert_eq!(config.token_ttl(), Duration::from_secs(300));
        assert_eq!(config.verify_max_attempts, 3);
    }
}
