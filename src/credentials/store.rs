//! In-memory credential store with transparent OAuth token refresh.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use super::{Credential, CredentialError, CredentialStore};
use crate::types::AccountKey;

/// Token endpoint used to refresh expired access tokens.
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

struct Entry {
    credential: Credential,
    // One refresh in flight per account; late arrivals re-check freshness
    // after acquiring the lock instead of refreshing again.
    refresh_lock: Arc<Mutex<()>>,
}

/// Credential store backed by process memory.
///
/// Refreshes happen lazily inside `get_fresh` via a form POST to the
/// configured token endpoint. Without an endpoint, expired credentials
/// surface as `NotAuthorized`.
pub struct TokenStore {
    entries: RwLock<HashMap<AccountKey, Entry>>,
    endpoint: Option<RefreshEndpoint>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenStore {
    pub fn new(endpoint: Option<RefreshEndpoint>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            entries: RwLock::new(HashMap::new()),
            endpoint,
            client,
        }
    }

    /// Insert or replace the credential for an account.
    pub async fn store(&self, key: AccountKey, credential: Credential) {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&key) {
            Some(entry) => entry.credential = credential,
            None => {
                entries.insert(
                    key,
                    Entry {
                        credential,
                        refresh_lock: Arc::new(Mutex::new(())),
                    },
                );
            }
        }
    }

    async fn refresh(&self, key: &AccountKey, refresh_token: &str) -> Result<Credential, CredentialError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(CredentialError::NotAuthorized)?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &endpoint.client_id),
        ];
        let secret;
        if let Some(s) = &endpoint.client_secret {
            secret = s.clone();
            params.push(("client_secret", &secret));
        }

        debug!(account = %key, "Refreshing access token");

        let response = self
            .client
            .post(&endpoint.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            warn!(account = %key, status = %response.status(), "Token refresh rejected");
            return Err(CredentialError::NotAuthorized);
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;

        let expires_at = Utc::now()
            + chrono::Duration::seconds(parsed.expires_in.unwrap_or(3600) as i64);

        Ok(Credential {
            access_token: parsed.access_token,
            // Some providers omit the refresh token on refresh; keep the old one.
            refresh_token: Some(parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string())),
            expires_at,
        })
    }
}

#[async_trait]
impl CredentialStore for TokenStore {
    async fn get_fresh(&self, key: &AccountKey) -> Result<Credential, CredentialError> {
        let now = Utc::now();

        let (credential, refresh_lock) = {
            let entries = self.entries.read().await;
            let entry = entries.get(key).ok_or(CredentialError::NotAuthorized)?;
            (entry.credential.clone(), entry.refresh_lock.clone())
        };

        if credential.is_fresh(now) {
            return Ok(credential);
        }

        let _guard = refresh_lock.lock().await;

        // A concurrent caller may have refreshed while we waited.
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.credential.is_fresh(Utc::now()) {
                    return Ok(entry.credential.clone());
                }
            }
        }

        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or(CredentialError::NotAuthorized)?;

        let refreshed = self.refresh(key, &refresh_token).await?;
        self.store(key.clone(), refreshed.clone()).await;
        info!(account = %key, "Access token refreshed");
        Ok(refreshed)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<String>, CredentialError> {
        let entries = self.entries.read().await;
        let mut emails: Vec<String> = entries
            .keys()
            .filter(|key| key.user_id == user_id)
            .map(|key| key.email.clone())
            .collect();
        emails.sort();
        Ok(emails)
    }

    async fn revoke(&self, user_id: &str, email: Option<&str>) -> Result<(), CredentialError> {
        let mut entries = self.entries.write().await;
        match email {
            Some(email) => {
                entries.remove(&AccountKey::new(user_id, email));
            }
            None => {
                entries.retain(|key, _| key.user_id != user_id);
            }
        }
        Ok(())
    }
}
