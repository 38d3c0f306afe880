use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("login to cell `{cell}` failed: {reason}")]
    Login { cell: String, reason: String },
    #[error("storage answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A storage host plus the cell (tenant) on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageTarget {
    pub host: String,
    pub cell: String,
}

impl StorageTarget {
    pub fn new(host: impl Into<String>, cell: impl Into<String>) -> Self {
        Self { host: host.into(), cell: cell.into() }
    }

    /// `https://{host}/{cell}`; a host that already carries a scheme is kept.
    pub fn cell_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/{}", self.cell)
        } else {
            format!("https://{host}/{}", self.cell)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[async_trait]
pub trait StorageClient: Send + Sync + 'static {
    async fn login(&self, target: &StorageTarget, username: &str, password: &str) -> Result<StorageToken, StorageError>;
    async fn refresh(&self, target: &StorageTarget, refresh_token: &str) -> Result<StorageToken, StorageError>;
    async fn post(&self, target: &StorageTarget, token: &StorageToken, path: &str, body: &Value) -> Result<(), StorageError>;
}

/// Personium cell storage over its REST API.
#[derive(Clone, Default)]
pub struct PersoniumClient {
    http: reqwest::Client,
}

impl PersoniumClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn token(&self, target: &StorageTarget, form: &[(&str, &str)]) -> Result<StorageToken, StorageError> {
        let url = format!("{}/__token", target.cell_url());
        let rsp = self.http.post(&url).form(form).send().await?;
        if !rsp.status().is_success() {
            return Err(StorageError::Login {
                cell: target.cell.clone(),
                reason: format!("status {}", rsp.status()),
            });
        }
        Ok(rsp.json().await?)
    }
}

#[async_trait]
impl StorageClient for PersoniumClient {
    async fn login(&self, target: &StorageTarget, username: &str, password: &str) -> Result<StorageToken, StorageError> {
        self.token(target, &[("grant_type", "password"), ("username", username), ("password", password)])
            .await
    }

    async fn refresh(&self, target: &StorageTarget, refresh_token: &str) -> Result<StorageToken, StorageError> {
        self.token(target, &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }

    async fn post(&self, target: &StorageTarget, token: &StorageToken, path: &str, body: &Value) -> Result<(), StorageError> {
        let url = format!("{}/{}", target.cell_url(), path.trim_start_matches('/'));
        let rsp = self
            .http
            .post(&url)
            .bearer_auth(&token.access_token)
            .json(body)
            .send()
            .await?;
        if !rsp.status().is_success() {
            return Err(StorageError::Status { status: rsp.status().as_u16(), url });
        }
        Ok(())
    }
}

/// Logged-in access to one cell. Refreshes an expired token before use and
/// logs in again when the refresh is refused.
pub struct StorageSession {
    client: Arc<dyn StorageClient>,
    target: StorageTarget,
    username: String,
    password: String,
    token: Mutex<Option<(StorageToken, Instant)>>,
}

const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

impl StorageSession {
    pub fn new(client: Arc<dyn StorageClient>, target: StorageTarget, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client,
            target,
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    pub async fn login(&self) -> Result<(), StorageError> {
        let token = self.client.login(&self.target, &self.username, &self.password).await?;
        self.store(&mut *self.token.lock().await, token);
        Ok(())
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<(), StorageError> {
        let token = self.fresh_token().await?;
        self.client.post(&self.target, &token, path, body).await
    }

    async fn fresh_token(&self) -> Result<StorageToken, StorageError> {
        let mut slot = self.token.lock().await;
        if let Some((token, expires_at)) = slot.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
            if let Some(refresh) = token.refresh_token.clone() {
                info!(cell = %self.target.cell, "storage token expired; refreshing");
                match self.client.refresh(&self.target, &refresh).await {
                    Ok(fresh) => return Ok(self.store(&mut slot, fresh)),
                    Err(e) => warn!(cell = %self.target.cell, error = %e, "refresh refused; logging in again"),
                }
            }
        }
        let fresh = self.client.login(&self.target, &self.username, &self.password).await?;
        Ok(self.store(&mut slot, fresh))
    }

    fn store(&self, slot: &mut Option<(StorageToken, Instant)>, token: StorageToken) -> StorageToken {
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        *slot = Some((token.clone(), Instant::now() + lifetime));
        token
    }
}
