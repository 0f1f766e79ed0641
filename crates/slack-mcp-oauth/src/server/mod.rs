//! HTTP server for the Slack MCP authorization service.
//!
//! Serves the OAuth 2.1 endpoints, the discovery documents and the
//! bearer-protected API, with background cleanup of expired flow records.

pub mod oauth;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

pub use router::{AppState, create_router};

use crate::config::Config;

/// Authorization server.
pub struct AuthServer {
    state: Arc<AppState>,
}

impl AuthServer {
    /// Create a server from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the client store cannot be opened or an HTTP client
    /// cannot be built.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let state = AppState::from_config(config).await?;
        Ok(Self { state: Arc::new(state) })
    }

    /// Wrap already assembled state.
    #[must_use]
    pub const fn from_state(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Shared state, for embedding the router elsewhere.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Run the server in HTTP mode.
    ///
    /// # Errors
    ///
    /// Returns error on server failure.
    pub async fn run_http(self, port: u16) -> anyhow::Result<()> {
        tracing::info!(
            base_url = %self.state.config.base_url,
            "Starting Slack MCP OAuth server on port {}",
            port
        );

        Arc::clone(&self.state.sessions).start_cleanup_task();

        let router = create_router(self.state);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        tracing::info!("HTTP server listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

        tracing::info!("HTTP server shut down");
        Ok(())
    }
}

impl std::fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServer").field("base_url", &self.state.config.base_url).finish()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}
