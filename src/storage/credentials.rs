//! OAuth refresh-token exchange for the Drive backend.
//!
//! Holds the long-lived refresh token and a short-lived access token cache,
//! refreshing before expiry.

use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{StorageError, StorageResult};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh ahead of expiry by this much.
const REFRESH_MARGIN: Duration = Duration::seconds(60);

#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn fresh(cached: Option<&CachedToken>) -> Option<String> {
    cached
        .filter(|c| c.expires_at - REFRESH_MARGIN > OffsetDateTime::now_utc())
        .map(|c| c.access_token.clone())
}

pub struct TokenSource {
    http: reqwest::Client,
    client: OAuthClient,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(client: OAuthClient) -> Self {
        Self {
            http: reqwest::Client::new(),
            client,
            cached: RwLock::new(None),
        }
    }

    /// Returns a valid access token, refreshing if the cached one is missing
    /// or about to expire. Concurrent callers share one exchange.
    pub async fn access_token(&self) -> StorageResult<String> {
        if let Some(token) = fresh(self.cached.read().await.as_ref()) {
            return Ok(token);
        }
        let mut cached = self.cached.write().await;
        // another caller may have refreshed while we waited for the lock
        if let Some(token) = fresh(cached.as_ref()) {
            return Ok(token);
        }
        debug!("access token missing or expiring, refreshing");
        let token = self.exchange().await?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    /// Forces a refresh-token exchange.
    pub async fn refresh(&self) -> StorageResult<String> {
        let mut cached = self.cached.write().await;
        let token = self.exchange().await?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    async fn exchange(&self) -> StorageResult<CachedToken> {
        let resp = self
            .http
            .post(&self.client.token_url)
            .form(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("refresh_token", self.client.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("token exchange: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(StorageError::Unavailable(format!("token exchange: {status}")));
            }
            let err = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(e) if e.error == "invalid_grant" => StorageError::Credentials(
                    "refresh token expired or revoked (invalid_grant); \
                     run the OAuth consent flow again and update GOOGLE_REFRESH_TOKEN"
                        .into(),
                ),
                Ok(e) => StorageError::Credentials(format!(
                    "{}: {}",
                    e.error,
                    e.error_description.unwrap_or_default()
                )),
                Err(_) => StorageError::Credentials(format!("token exchange: {status}")),
            };
            warn!(error = %err, "oauth refresh failed");
            return Err(err);
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Credentials(format!("token response: {e}")))?;
        let expires_at = OffsetDateTime::now_utc() + Duration::seconds(token.expires_in);
        debug!(%expires_at, "oauth access token refreshed");
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at,
        })
    }

    /// Drops the cached access token, e.g. after the API answered 401.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
