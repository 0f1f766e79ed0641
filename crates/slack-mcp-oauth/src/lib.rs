//! Slack MCP OAuth Server
//!
//! An OAuth 2.1 authorization server and proxy for the Slack MCP service.
//! It dynamically registers MCP clients, runs a PKCE-protected
//! authorization-code flow through Slack's own OAuth, mints opaque bearer
//! tokens and resolves them back to the Slack credential on protected calls.
//!
//! # Features
//!
//! - **Dynamic registration** (RFC 7591) with a redirect-host allow-list
//! - **PKCE S256 only**, exact redirect URI matching
//! - **Single-use states and codes**, atomic under concurrent redemption
//! - **Transport session binding**: one transport session, one identity
//! - **Durable token backup** to an object store, fire-and-forget
//!
//! # Example
//!
//! ```no_run
//! use slack_mcp_oauth::{config::Config, server::AuthServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let server = AuthServer::new(config).await?;
//!     server.run_http(8000).await
//! }
//! ```

pub mod backup;
pub mod config;
pub mod error;
pub mod server;
pub mod upstream;

pub use config::Config;
pub use error::{AuthError, AuthResult};
pub use server::{AppState, AuthServer, create_router};
