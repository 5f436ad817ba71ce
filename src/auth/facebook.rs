//! Facebook access-token verification via the Graph debug_token endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AuthError, CredentialVerifier, Result};
use crate::config::FacebookProviderConfig;
use crate::registry::UserId;

#[derive(Debug, Deserialize)]
struct DebugTokenResponse {
    data: DebugTokenData,
}

#[derive(Debug, Deserialize)]
struct DebugTokenData {
    is_valid: bool,
    user_id: Option<String>,
}

pub struct FacebookVerifier {
    client: reqwest::Client,
    endpoint: String,
    app_token: String,
}

impl FacebookVerifier {
    pub fn new(config: &FacebookProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            // App access token format required by the debug_token endpoint.
            app_token: format!("{}|{}", config.app_id, config.app_secret),
        }
    }
}

#[async_trait]
impl CredentialVerifier for FacebookVerifier {
    fn provider(&self) -> &'static str {
        "facebook"
    }

    async fn verify(&self, credential: &str) -> Result<UserId> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("input_token", credential), ("access_token", &self.app_token)])
            .send()
            .await
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AuthError::InvalidCredential);
        }
        if !status.is_success() {
            return Err(AuthError::ProviderUnavailable(format!(
                "debug_token returned {}",
                status
            )));
        }

        let body: DebugTokenResponse = response
            .json()
            .await
            .map_err(|_| AuthError::InvalidCredential)?;

        match (body.data.is_valid, body.data.user_id) {
            (true, Some(user_id)) => {
                debug!(user_id = %user_id, "Facebook credential verified");
                Ok(UserId::new(user_id))
            }
            _ => Err(AuthError::InvalidCredential),
        }
    }
}
