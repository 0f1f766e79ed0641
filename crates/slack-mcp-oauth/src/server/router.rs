//! HTTP router and shared state.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::oauth::bearer;
use super::oauth::handlers;
use super::oauth::registry::{ClientRegistry, ClientStore, FileClientStore, MemoryClientStore};
use super::oauth::store::SessionStore;
use crate::backup::{HttpTokenBackup, TokenBackup};
use crate::config::Config;
use crate::upstream::{SlackOAuthClient, UpstreamProvider};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub config: Config,
    pub registry: ClientRegistry,
    pub sessions: Arc<SessionStore>,
    /// `None` when Slack credentials are not configured.
    pub upstream: Option<Arc<dyn UpstreamProvider>>,
    /// `None` when no backup store is configured.
    pub backup: Option<Arc<dyn TokenBackup>>,
    pub register_limiter: DefaultDirectRateLimiter,
}

impl AppState {
    /// Assemble state from explicit collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        client_store: Arc<dyn ClientStore>,
        upstream: Option<Arc<dyn UpstreamProvider>>,
        backup: Option<Arc<dyn TokenBackup>>,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.registration_rate_per_minute).unwrap_or(NonZeroU32::MIN);
        let registry = ClientRegistry::new(config.allowed_redirect_hosts.clone(), client_store);

        Self {
            registry,
            sessions: Arc::new(SessionStore::new()),
            upstream,
            backup,
            register_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            config,
        }
    }

    /// Build state from configuration: file or memory client store, Slack
    /// client if credentials are set, HTTP backup if a URL is set.
    ///
    /// # Errors
    ///
    /// Returns error if the client file cannot be loaded or an HTTP client
    /// cannot be built.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let client_store: Arc<dyn ClientStore> = match &config.clients_path {
            Some(path) => Arc::new(FileClientStore::open(path.clone()).await?),
            None => {
                tracing::warn!("DYNAMIC_CLIENTS_PATH not set, client registrations will not survive restart");
                Arc::new(MemoryClientStore::new())
            }
        };

        let upstream: Option<Arc<dyn UpstreamProvider>> = if config.upstream_configured() {
            Some(Arc::new(SlackOAuthClient::new(&config)?))
        } else {
            tracing::warn!("Slack OAuth credentials not configured, /oauth2/authorize will fail");
            None
        };

        let backup: Option<Arc<dyn TokenBackup>> =
            HttpTokenBackup::from_config(&config)?.map(|b| Arc::new(b) as Arc<dyn TokenBackup>);

        if !config.registration_enabled() {
            tracing::warn!("ALLOWED_REDIRECT_HOSTS unset, dynamic client registration disabled");
        }

        Ok(Self::new(config, client_store, upstream, backup))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("upstream", &self.upstream)
            .field("backup", &self.backup)
            .finish()
    }
}

/// Create the HTTP router for the authorization server.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        // RFC 8414 / RFC 9728 discovery
        .route(
            "/.well-known/oauth-authorization-server",
            get(handlers::handle_auth_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(handlers::handle_protected_resource),
        )
        // RFC 7591
        .route("/register", post(handlers::handle_register))
        // Authorization code flow
        .route("/oauth2/authorize", get(handlers::handle_authorize))
        .route("/oauth2/callback", get(handlers::handle_callback))
        .route("/oauth2callback", get(handlers::handle_callback))
        .route("/oauth2/token", post(handlers::handle_token))
        .route("/oauth2/revoke", post(handlers::handle_revoke))
        // Protected
        .route("/api/me", get(bearer::handle_me))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sessions.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "slack-mcp-oauth",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream_configured": state.upstream.is_some(),
        "registration_enabled": state.registry.registration_enabled(),
        "token_backup": state.backup.is_some(),
        "store": stats
    }))
}

async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    Json(serde_json::json!({
        "service": "slack-mcp-oauth",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "authorization_server_metadata": config.endpoint("/.well-known/oauth-authorization-server"),
            "protected_resource_metadata": config.endpoint("/.well-known/oauth-protected-resource"),
            "register": config.endpoint("/register"),
            "authorize": config.endpoint("/oauth2/authorize"),
            "token": config.endpoint("/oauth2/token"),
            "revoke": config.endpoint("/oauth2/revoke"),
            "me": config.endpoint("/api/me"),
            "health": config.endpoint("/health")
        }
    }))
}
