//! Fuzzing library for slack-mcp-oauth.
//!
//! This crate provides fuzzing targets for the boundaries that parse
//! untrusted input: expiry values, registration bodies, backup objects and
//! PKCE verifiers.
//!
//! # Usage
//!
//! ```bash
//! cd crates/sentinel-fuzz
//! cargo +nightly fuzz run fuzz_expiry_parse -- -max_total_time=60
//! ```

pub use slack_mcp_oauth::backup::BackupRecord;
pub use slack_mcp_oauth::server::oauth::expiry;
pub use slack_mcp_oauth::server::oauth::handlers::RegisterRequest;
pub use slack_mcp_oauth::server::oauth::pkce;
