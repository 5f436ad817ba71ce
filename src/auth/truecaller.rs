//! Truecaller profile verification via bearer token.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AuthError, CredentialVerifier, Result};
use crate::config::TruecallerProviderConfig;
use crate::registry::UserId;

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "userId")]
    user_id: String,
}

pub struct TruecallerVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl TruecallerVerifier {
    pub fn new(config: &TruecallerProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for TruecallerVerifier {
    fn provider(&self) -> &'static str {
        "truecaller"
    }

    async fn verify(&self, credential: &str) -> Result<UserId> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AuthError::InvalidCredential);
        }
        if !status.is_success() {
            return Err(AuthError::ProviderUnavailable(format!(
                "profile endpoint returned {}",
                status
            )));
        }

        let profile: Profile = response
            .json()
            .await
            .map_err(|_| AuthError::InvalidCredential)?;

        debug!(user_id = %profile.user_id, "Truecaller credential verified");
        Ok(UserId::new(profile.user_id))
    }
}
