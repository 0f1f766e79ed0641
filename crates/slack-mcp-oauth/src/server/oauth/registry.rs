//! Dynamic client registry (RFC 7591).
//!
//! Registrations are persisted through an injectable [`ClientStore`]; the
//! registry itself only enforces the redirect-host allow-list and hashes secrets.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use url::Url;

use super::types::{ClientMetadata, ClientRegistration, RegisteredClient, constant_time_eq, generate_token};
use crate::config::slack;
use crate::error::{AuthError, AuthResult, PersistenceError};

/// Prefix of every client id we mint.
pub const CLIENT_ID_PREFIX: &str = "slack_mcp_";

/// Default display name for clients that do not send one.
pub const DEFAULT_CLIENT_NAME: &str = "Slack MCP Client";

/// Durable key-value storage for client registrations.
#[async_trait]
pub trait ClientStore: Send + Sync + std::fmt::Debug {
    /// Persist a registration.
    async fn put(&self, registration: &ClientRegistration) -> Result<(), PersistenceError>;

    /// Load a registration by client id.
    async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>, PersistenceError>;
}

/// Registrations kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryClientStore {
    clients: RwLock<BTreeMap<String, ClientRegistration>>,
}

impl MemoryClientStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStore for MemoryClientStore {
    async fn put(&self, registration: &ClientRegistration) -> Result<(), PersistenceError> {
        self.clients.write().await.insert(registration.client_id.clone(), registration.clone());
        Ok(())
    }

    async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>, PersistenceError> {
        Ok(self.clients.read().await.get(client_id).cloned())
    }
}

/// Registrations kept in a JSON document, rewritten atomically on every put.
#[derive(Debug)]
pub struct FileClientStore {
    path: PathBuf,
    clients: RwLock<BTreeMap<String, ClientRegistration>>,
}

impl FileClientStore {
    /// Open the store, loading existing registrations. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let clients = match tokio::fs::read(&path).await {
            Ok(raw) if raw.is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            count = clients.len(),
            "Loaded client registrations"
        );
        Ok(Self { path, clients: RwLock::new(clients) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomic(&self, payload: Vec<u8>) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path =
            self.path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClientStore for FileClientStore {
    async fn put(&self, registration: &ClientRegistration) -> Result<(), PersistenceError> {
        // Held across the write so concurrent puts cannot reorder on disk.
        let mut clients = self.clients.write().await;
        let mut next = clients.clone();
        next.insert(registration.client_id.clone(), registration.clone());
        let payload = serde_json::to_vec_pretty(&next)?;
        self.write_atomic(payload).await?;
        *clients = next;
        Ok(())
    }

    async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>, PersistenceError> {
        Ok(self.clients.read().await.get(client_id).cloned())
    }
}

/// Registry of dynamically registered OAuth clients.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    allowed_hosts: Vec<String>,
    store: Arc<dyn ClientStore>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(allowed_hosts: Vec<String>, store: Arc<dyn ClientStore>) -> Self {
        Self { allowed_hosts, store }
    }

    /// Registry backed by memory.
    #[must_use]
    pub fn in_memory(allowed_hosts: Vec<String>) -> Self {
        Self::new(allowed_hosts, Arc::new(MemoryClientStore::new()))
    }

    /// Check if registration is possible at all.
    #[must_use]
    pub fn registration_enabled(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }

    /// Register a new client. The returned secret is never retrievable again.
    pub async fn register(
        &self,
        redirect_uris: Vec<String>,
        metadata: ClientMetadata,
    ) -> AuthResult<RegisteredClient> {
        if redirect_uris.is_empty() {
            return Err(AuthError::InvalidClientMetadata(
                "redirect_uris required as a non-empty array".to_string(),
            ));
        }
        if !self.registration_enabled() {
            return Err(AuthError::NotConfigured(
                "Client registration not configured (ALLOWED_REDIRECT_HOSTS unset)".to_string(),
            ));
        }

        for uri in &redirect_uris {
            let parsed = Url::parse(uri).map_err(|e| {
                AuthError::InvalidClientMetadata(format!("Invalid redirect URI {uri:?}: {e}"))
            })?;
            if parsed.fragment().is_some() {
                return Err(AuthError::InvalidClientMetadata(format!(
                    "Redirect URI must not contain a fragment: {uri:?}"
                )));
            }
            let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
            if !self.allowed_hosts.iter().any(|allowed| *allowed == host) {
                tracing::warn!(redirect_uri = %uri, host = %host, "Rejected redirect URI host");
                return Err(AuthError::authorization(format!(
                    "Redirect URI host not allowed: {host}"
                )));
            }
        }

        let client_secret = generate_token(32);
        let registration = ClientRegistration {
            client_id: format!("{CLIENT_ID_PREFIX}{}", generate_token(16)),
            client_secret_hash: hash_secret(&client_secret),
            client_name: metadata.client_name.unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
            redirect_uris: redirect_uris.into_iter().collect::<BTreeSet<_>>(),
            grant_types: metadata.grant_types.unwrap_or_else(|| {
                vec!["authorization_code".to_string(), "refresh_token".to_string()]
            }),
            response_types: metadata.response_types.unwrap_or_else(|| vec!["code".to_string()]),
            token_endpoint_auth_method: metadata
                .token_endpoint_auth_method
                .unwrap_or_else(|| "client_secret_post".to_string()),
            scope: metadata.scope.unwrap_or_else(slack::default_scope),
            created_at: Utc::now(),
        };

        self.store.put(&registration).await?;

        tracing::info!(
            client_id = %registration.client_id,
            client_name = %registration.client_name,
            redirect_uris = registration.redirect_uris.len(),
            "Registered OAuth client"
        );
        Ok(RegisteredClient { registration, client_secret })
    }

    /// Look up a client by ID.
    pub async fn lookup(&self, client_id: &str) -> AuthResult<Option<ClientRegistration>> {
        Ok(self.store.get(client_id).await?)
    }

    /// Check a client's secret. Unknown clients never authenticate.
    pub async fn authenticate(&self, client_id: &str, client_secret: &str) -> AuthResult<bool> {
        let Some(client) = self.lookup(client_id).await? else {
            return Ok(false);
        };
        Ok(constant_time_eq(&client.client_secret_hash, &hash_secret(client_secret)))
    }

    /// Check that `uri` is exactly one of the client's registered redirect URIs.
    pub async fn validate_redirect_uri(&self, client_id: &str, uri: &str) -> AuthResult<bool> {
        Ok(self.lookup(client_id).await?.is_some_and(|client| client.redirect_uris.contains(uri)))
    }
}

fn hash_secret(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::in_memory(vec!["client.example".to_string()])
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let registry = registry();
        let client = registry
            .register(vec!["https://client.example/cb".into()], ClientMetadata::default())
            .await
            .unwrap();

        let id = &client.registration.client_id;
        assert!(id.starts_with(CLIENT_ID_PREFIX));
        assert_eq!(client.registration.client_name, DEFAULT_CLIENT_NAME);
        assert_ne!(client.registration.client_secret_hash, client.client_secret);

        assert!(registry.authenticate(id, &client.client_secret).await.unwrap());
        assert!(!registry.authenticate(id, "wrong").await.unwrap());
        assert!(!registry.authenticate("unknown", &client.client_secret).await.unwrap());
    }

    #[tokio::test]
    async fn test_redirect_uri_exact_match() {
        let registry = registry();
        let client = registry
            .register(vec!["https://client.example/cb".into()], ClientMetadata::default())
            .await
            .unwrap();
        let id = &client.registration.client_id;

        assert!(registry.validate_redirect_uri(id, "https://client.example/cb").await.unwrap());
        assert!(!registry.validate_redirect_uri(id, "https://client.example/cb/").await.unwrap());
        assert!(!registry.validate_redirect_uri(id, "https://client.example/cb?x=1").await.unwrap());
        assert!(!registry.validate_redirect_uri("other", "https://client.example/cb").await.unwrap());
    }

    #[tokio::test]
    async fn test_register_rejections() {
        let registry = registry();
        let err = registry.register(vec![], ClientMetadata::default()).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let err = registry
            .register(vec!["https://evil.example/cb".into()], ClientMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);

        let err = registry
            .register(vec!["https://client.example/cb#frag".into()], ClientMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidClientMetadata(_)));

        let err = registry
            .register(vec!["not a url".into()], ClientMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let closed = ClientRegistry::in_memory(vec![]);
        let err = closed
            .register(vec!["https://client.example/cb".into()], ClientMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
