//! Durable token backup.
//!
//! A best-effort mirror of Slack credentials in an external object store,
//! keyed by (team, user), read only for disaster recovery. Writes are
//! fire-and-forget: [`spawn_store`] and [`spawn_delete`] log failures and
//! never report them to the request that triggered them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::BackupError;
use crate::server::oauth::expiry::normalize_expiry;
use crate::server::oauth::types::{Session, SessionKey};

/// Stored copy of a session's Slack credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub user_id: String,
    pub team_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub bot_user_id: Option<String>,
    pub enterprise_id: Option<String>,
    /// Objects written by older tooling carry unix seconds or naive text here.
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(secs) => normalize_expiry(secs),
            None => n.as_f64().and_then(normalize_expiry),
        },
        Some(Value::String(text)) => normalize_expiry(text),
        Some(other) => normalize_expiry(other.to_string()),
    })
}

impl BackupRecord {
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        Self {
            user_id: session.key.user_id.clone(),
            team_id: session.key.team_id.clone(),
            access_token: session.upstream_access_token.clone(),
            refresh_token: session.upstream_refresh_token.clone(),
            scopes: session.scopes.clone(),
            bot_user_id: session.bot_user_id.clone(),
            enterprise_id: session.enterprise_id.clone(),
            expires_at: session.upstream_expires_at,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.team_id, &self.user_id)
    }
}

impl std::fmt::Debug for BackupRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupRecord")
            .field("user_id", &self.user_id)
            .field("team_id", &self.team_id)
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// External storage for upstream credentials.
#[async_trait]
pub trait TokenBackup: Send + Sync + std::fmt::Debug {
    async fn store(&self, record: &BackupRecord) -> Result<(), BackupError>;

    async fn load(&self, key: &SessionKey) -> Result<Option<BackupRecord>, BackupError>;

    async fn delete(&self, key: &SessionKey) -> Result<(), BackupError>;
}

/// Mirror `session` to the backup in the background.
pub fn spawn_store(backup: Arc<dyn TokenBackup>, session: &Session) {
    let record = BackupRecord::from_session(session);
    tokio::spawn(async move {
        match backup.store(&record).await {
            Ok(()) => tracing::debug!(session = %record.key(), "Backed up upstream token"),
            Err(e) => tracing::warn!(
                session = %record.key(),
                error = %e,
                "Token backup write failed"
            ),
        }
    });
}

/// Delete the backup for `key` in the background.
pub fn spawn_delete(backup: Arc<dyn TokenBackup>, key: SessionKey) {
    tokio::spawn(async move {
        if let Err(e) = backup.delete(&key).await {
            tracing::warn!(session = %key, error = %e, "Token backup delete failed");
        }
    });
}

/// Object store reached over HTTPS: `{base}/tokens/{team}/{user}.json`.
#[derive(Clone)]
pub struct HttpTokenBackup {
    client: ClientWithMiddleware,
    base_url: String,
    token: Option<String>,
}

impl HttpTokenBackup {
    /// Create a backup client for `base_url`.
    ///
    /// Retries transient failures with exponential backoff; this runs off the
    /// request path, so waiting is harmless.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(200), Duration::from_secs(10))
            .build_with_max_retries(3);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), token })
    }

    /// Build from configuration; `None` when no backup URL is configured.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        config
            .token_backup_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.token_backup_token.clone(), config.upstream_timeout))
            .transpose()
    }

    fn object_url(&self, key: &SessionKey) -> String {
        format!("{}/tokens/{}/{}.json", self.base_url, key.team_id, key.user_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackupError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackupError::Status { status: status.as_u16(), message })
    }
}

impl std::fmt::Debug for HttpTokenBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenBackup")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

#[async_trait]
impl TokenBackup for HttpTokenBackup {
    async fn store(&self, record: &BackupRecord) -> Result<(), BackupError> {
        let body = serde_json::to_vec(record)?;
        let request = self
            .client
            .put(self.object_url(&record.key()))
            .header("Content-Type", "application/json")
            .body(body);
        let response = self.authorize(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<BackupRecord>, BackupError> {
        let request = self.client.get(self.object_url(key));
        let response = self.authorize(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        let bytes = response.bytes().await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), BackupError> {
        let request = self.client.delete(self.object_url(key));
        let response = self.authorize(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

/// In-process backup, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryTokenBackup {
    records: RwLock<HashMap<SessionKey, BackupRecord>>,
}

impl MemoryTokenBackup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl TokenBackup for MemoryTokenBackup {
    async fn store(&self, record: &BackupRecord) -> Result<(), BackupError> {
        self.records.write().await.insert(record.key(), record.clone());
        Ok(())
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), BackupError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}
