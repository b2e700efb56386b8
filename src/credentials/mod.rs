//! Credential access
//!
//! Agents never own credentials; they borrow a momentary access token from
//! the store right before connecting. The store refreshes transparently and
//! serializes refreshes per account.

mod store;

pub use store::{RefreshEndpoint, TokenStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::AccountKey;

/// Minimum remaining validity of a credential returned by `get_fresh`.
pub const MIN_VALIDITY: Duration = Duration::from_secs(60);

/// A short-lived access credential for one account.
#[derive(Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True when the credential is still valid `MIN_VALIDITY` from now.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(MIN_VALIDITY).unwrap_or(chrono::Duration::zero());
        self.expires_at >= now + margin
    }
}

// Token material must never reach logs or error messages.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// No credential is stored, or the upstream rejected the refresh.
    /// Not retryable until a new credential is stored.
    #[error("not authorized")]
    NotAuthorized,

    /// The refresh transport itself failed. Retryable.
    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Per-account credential source.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Return a credential valid for at least [`MIN_VALIDITY`], refreshing
    /// transparently with the stored refresh token when needed.
    async fn get_fresh(&self, key: &AccountKey) -> Result<Credential, CredentialError>;

    /// All email addresses with stored credentials for a user.
    async fn list(&self, user_id: &str) -> Result<Vec<String>, CredentialError>;

    /// Drop credentials for one account, or for every account of a user.
    /// Best-effort and idempotent.
    async fn revoke(&self, user_id: &str, email: Option<&str>) -> Result<(), CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token_material() {
        let cred = Credential {
            access_token: "ya29.secret-token".into(),
            refresh_token: Some("1//refresh-secret".into()),
            expires_at: Utc::now(),
        };
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn freshness_requires_sixty_second_margin() {
        let now = Utc::now();
        let fresh = Credential {
            access_token: "t".into(),
            refresh_token: None,
            expires_at: now + chrono::Duration::seconds(61),
        };
        let stale = Credential {
            access_token: "t".into(),
            refresh_token: None,
            expires_at: now + chrono::Duration::seconds(30),
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }
}
