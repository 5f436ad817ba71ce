//! Authentication handshake.
//!
//! This module contains:
//! - `CredentialVerifier` trait: one capability, one implementation per
//!   identity provider (Google, Facebook, Truecaller)
//! - `VerifierRegistry`: provider selection fixed at startup
//! - `token`: one-time session tokens minted on HTTP admission and
//!   redeemed at socket connect
//!
//! The router and admission API depend only on the capability, never on a
//! specific provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use tracing::warn;

use crate::config::AuthConfig;
use crate::registry::UserId;
use crate::utils::retry::provider_backoff;

pub mod facebook;
pub mod google;
pub mod token;
pub mod truecaller;

pub use token::TokenStore;

/// Result type for credential verification.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur during credential verification.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Terminal for the connection attempt; the connection is refused.
    #[error("invalid credential")]
    InvalidCredential,

    /// Transient; retryable with bounded backoff before turning terminal.
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Verifies a bearer credential against an identity provider.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Provider name this verifier serves (e.g. "google").
    fn provider(&self) -> &'static str;

    /// Validate the credential and yield the verified user identifier.
    async fn verify(&self, credential: &str) -> Result<UserId>;
}

/// Provider registry built once at startup.
///
/// Call sites select a verifier by provider name here instead of branching
/// on the name themselves.
#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<String, Arc<dyn CredentialVerifier>>,
    max_attempts: usize,
}

impl VerifierRegistry {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            verifiers: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Build the registry from configuration, registering each enabled
    /// provider.
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut registry = Self::new(config.verify_max_attempts);
        if config.google.enabled {
            registry.register(Arc::new(google::GoogleVerifier::new(&config.google)));
        }
        if config.facebook.enabled {
            registry.register(Arc::new(facebook::FacebookVerifier::new(&config.facebook)));
        }
        if config.truecaller.enabled {
            registry.register(Arc::new(truecaller::TruecallerVerifier::new(
                &config.truecaller,
            )));
        }
        registry
    }

    pub fn register(&mut self, verifier: Arc<dyn CredentialVerifier>) {
        self.verifiers
            .insert(verifier.provider().to_string(), verifier);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn CredentialVerifier>> {
        self.verifiers.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        self.verifiers.keys().map(String::as_str).collect()
    }

    /// Verify with bounded retries.
    ///
    /// `ProviderUnavailable` is retried with backoff up to the configured
    /// attempt cap, then surfaced as terminal. `InvalidCredential` is
    /// terminal immediately.
    pub async fn verify_with_retry(&self, provider: &str, credential: &str) -> Result<UserId> {
        let verifier = self
            .get(provider)
            .ok_or(AuthError::InvalidCredential)?;

        let attempts = self.max_attempts;
        (|| async { verifier.verify(credential).await })
            .retry(provider_backoff(attempts))
            .when(|e| matches!(e, AuthError::ProviderUnavailable(_)))
            .notify(|e: &AuthError, dur| {
                warn!(provider, error = %e, retry_in_ms = %dur.as_millis(), "Provider verify failed, retrying");
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyVerifier {
        calls: AtomicUsize,
        succeed_after: usize,
    }

    #[async_trait]
    impl CredentialVerifier for FlakyVerifier {
        fn provider(&self) -> &'static str {
            "flaky"
        }

        async fn verify(&self, _credential: &str) -> Result<UserId> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call + 1 >= self.succeed_after {
                Ok(UserId::from("alice"))
            } else {
                Err(AuthError::ProviderUnavailable("down".into()))
            }
        }
    }

    struct RejectingVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialVerifier for RejectingVerifier {
        fn provider(&self) -> &'static str {
            "rejecting"
        }

        async fn verify(&self, _credential: &str) -> Result<UserId> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::InvalidCredential)
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_outage() {
        let mut registry = VerifierRegistry::new(5);
        registry.register(Arc::new(FlakyVerifier {
            calls: AtomicUsize::new(0),
            succeed_after: 3,
        }));

        let user = registry.verify_with_retry("flaky", "cred").await.unwrap();
        assert_eq!(user, UserId::from("alice"));
    }

    #[tokio::test]
    async fn test_invalid_credential_not_retried() {
        let verifier = Arc::new(RejectingVerifier {
            calls: AtomicUsize::new(0),
        });
        let mut registry = VerifierRegistry::new(5);
        registry.register(Arc::clone(&verifier) as Arc<dyn CredentialVerifier>);

        let err = registry
            .verify_with_retry("rejecting", "cred")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_turns_terminal_after_cap() {
        let mut registry = VerifierRegistry::new(2);
        registry.register(Arc::new(FlakyVerifier {
            calls: AtomicUsize::new(0),
            succeed_after: 100,
        }));

        let err = registry
            .verify_with_retry("flaky", "cred")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_invalid() {
        let registry = VerifierRegistry::new(1);
        let err = registry
            .verify_with_retry("unknown", "cred")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }
}
