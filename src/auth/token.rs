//! One-time session tokens.
//!
//! The HTTP admission API mints a token after a successful provider
//! handshake; the socket connect presents it once. Tokens are opaque,
//! short-lived, and single-use: redeeming consumes the entry, and an
//! expired, unknown, or reused token is an invalid credential.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuthError, Result};
use crate::registry::UserId;

struct IssuedToken {
    user_id: UserId,
    issued_at: DateTime<Utc>,
}

/// In-memory store of outstanding session tokens.
pub struct TokenStore {
    tokens: Mutex<HashMap<String, IssuedToken>>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Mint a token for a verified user.
    pub async fn issue(&self, user_id: UserId) -> String {
        let token = Uuid::new_v4().to_string();
        let mut tokens = self.tokens.lock().await;

        // Opportunistic purge keeps the map from accumulating expired
        // entries between redemptions.
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        tokens.retain(|_, t| now - t.issued_at <= ttl);

        tokens.insert(
            token.clone(),
            IssuedToken {
                user_id,
                issued_at: now,
            },
        );
        token
    }

    /// Redeem a token exactly once, yielding the user it was minted for.
    pub async fn redeem(&self, token: &str) -> Result<UserId> {
        let mut tokens = self.tokens.lock().await;
        let issued = tokens.remove(token).ok_or(AuthError::InvalidCredential)?;

        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        if Utc::now() - issued.issued_at > ttl {
            return Err(AuthError::InvalidCredential);
        }
        Ok(issued.user_id)
    }

    /// Number of outstanding tokens.
    pub async fn outstanding(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_redeem() {
        let store = TokenStore::new(Duration::from_secs(60));
        let token = store.issue(UserId::from("alice")).await;

        let user = store.redeem(&token).await.unwrap();
        assert_eq!(user, UserId::from("alice"));
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let store = TokenStore::new(Duration::from_secs(60));
        let token = store.issue(UserId::from("alice")).await;

        store.redeem(&token).await.unwrap();
        let err = store.redeem(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let store = TokenStore::new(Duration::from_secs(60));
        let err = store.redeem("not-a-token").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let store = TokenStore::new(Duration::ZERO);
        let token = store.issue(UserId::from("alice")).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = store.redeem(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn test_issue_purges_expired() {
        let store = TokenStore::new(Duration::ZERO);
        store.issue(UserId::from("alice")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.issue(UserId::from("bob")).await;
        assert_eq!(store.outstanding().await, 1);
    }
}
