//! OAuth 2.1 authorization server fronting Slack's OAuth.
//!
//! External MCP clients register dynamically, authorize with PKCE, and are
//! bounced through Slack. The server then mints its own opaque tokens and
//! resolves them back to the Slack credential on every protected call.
//!
//! ## Supported Standards
//! - RFC 9728: OAuth Protected Resource Metadata
//! - RFC 8414: OAuth Authorization Server Metadata
//! - RFC 7591: Dynamic Client Registration
//! - RFC 7636: PKCE (S256 only)
//! - RFC 6749: Authorization Code and Refresh Token Grants
//! - RFC 7009: Token Revocation
//! - RFC 6750: Bearer Token Usage

pub mod bearer;
pub mod expiry;
pub mod handlers;
pub mod pkce;
pub mod registry;
pub mod store;
pub mod types;

pub use bearer::AuthenticatedSession;
pub use registry::{ClientRegistry, ClientStore, FileClientStore, MemoryClientStore};
pub use store::SessionStore;
