//! Google ID-token verification via the tokeninfo endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AuthError, CredentialVerifier, Result};
use crate::config::GoogleProviderConfig;
use crate::registry::UserId;

#[derive(Debug, Deserialize)]
struct TokenInfo {
    /// Stable Google account identifier.
    sub: String,
}

pub struct GoogleVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleVerifier {
    pub fn new(config: &GoogleProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for GoogleVerifier {
    fn provider(&self) -> &'static str {
        "google"
    }

    async fn verify(&self, credential: &str) -> Result<UserId> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("id_token", credential)])
            .send()
            .await
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AuthError::InvalidCredential);
        }
        if !status.is_success() {
            return Err(AuthError::ProviderUnavailable(format!(
                "tokeninfo returned {}",
                status
            )));
        }

        let info: TokenInfo = response
            .json()
            .await
            .map_err(|_| AuthError::InvalidCredential)?;

        debug!(sub = %info.sub, "Google credential verified");
        Ok(UserId::new(info.sub))
    }
}
