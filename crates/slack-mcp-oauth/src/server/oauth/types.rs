//! OAuth 2.1 records owned by the registry and the session store.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::expiry::ExpiryInput;

/// Generate an opaque URL-safe token from `bytes` random bytes.
pub fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Compare two secrets without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// First eight characters of a secret, for logs.
pub fn redact(secret: &str) -> &str {
    secret.char_indices().nth(8).map_or(secret, |(i, _)| &secret[..i])
}

/// A dynamically registered OAuth client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    /// Base64url SHA-256 of the client secret; the secret itself is shown once.
    pub client_secret_hash: String,
    pub client_name: String,
    pub redirect_uris: BTreeSet<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

/// A freshly registered client together with its one-time secret.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub registration: ClientRegistration,
    pub client_secret: String,
}

/// Optional metadata supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    pub client_name: Option<String>,
    pub grant_types: Option<Vec<String>>,
    pub response_types: Option<Vec<String>>,
    pub scope: Option<String>,
    pub token_endpoint_auth_method: Option<String>,
}

/// Everything remembered while the user is away at Slack.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Browser correlation id the callback must present again.
    pub bound_correlation_id: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    /// Redirect URI Slack was told to call back on.
    pub redirect_uri: String,
    pub scopes: String,
    /// The external client's own `state`, echoed back at the end.
    pub external_state: String,
    pub client_id: String,
    pub external_redirect_uri: String,
}

/// A stored OAuth state.
#[derive(Debug, Clone)]
pub struct OAuthStateRecord {
    pub state: String,
    pub pending: PendingAuthorization,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthStateRecord {
    /// Check if the state has expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Slack credential obtained from the code exchange. Never returned to clients.
#[derive(Clone, Default)]
pub struct UpstreamCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub bot_user_id: Option<String>,
    pub enterprise_id: Option<String>,
}

impl std::fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("access_token", &redact(&self.access_token))
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("bot_user_id", &self.bot_user_id)
            .field("enterprise_id", &self.enterprise_id)
            .finish()
    }
}

/// Grant carried by one of our authorization codes.
#[derive(Debug, Clone)]
pub struct CodeGrant {
    pub user_id: String,
    pub team_id: String,
    pub scopes: Vec<String>,
    pub code_challenge: Option<String>,
    /// Client the code was issued to.
    pub client_id: String,
    pub upstream: UpstreamCredential,
}

/// A stored authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationCodeRecord {
    pub code: String,
    pub grant: CodeGrant,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl AuthorizationCodeRecord {
    /// Check if the code has expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Identity a session is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub team_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(team_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { team_id: team_id.into(), user_id: user_id.into() }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slack_{}_{}", self.team_id, self.user_id)
    }
}

/// Our access/refresh pair.
#[derive(Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    /// Mint a fresh pair (256 bits each).
    pub fn generate() -> Self {
        Self { access_token: generate_token(32), refresh_token: generate_token(32) }
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Input to `SessionStore::store_session`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub key: SessionKey,
    pub tokens: TokenPair,
    pub token_type: String,
    pub scopes: Vec<String>,
    /// Normalized to UTC when stored.
    pub expiry: Option<ExpiryInput>,
    pub session_id: String,
    pub transport_session_id: Option<String>,
    pub client_id: String,
    pub upstream: UpstreamCredential,
}

/// An authenticated session.
#[derive(Clone)]
pub struct Session {
    pub key: SessionKey,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub session_id: String,
    pub transport_session_id: Option<String>,
    pub client_id: String,
    pub bot_user_id: Option<String>,
    pub enterprise_id: Option<String>,
    pub upstream_access_token: String,
    pub upstream_refresh_token: Option<String>,
    /// When the Slack user token expires, if Slack rotates it.
    pub upstream_expires_at: Option<DateTime<Utc>>,
    pub issuer: String,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.key.user_id
    }

    pub fn team_id(&self) -> &str {
        &self.key.team_id
    }

    /// Check if the access token has expired. Sessions without expiry never do.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    /// Seconds until the access token expires.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiry.map(|expiry| (expiry - now).num_seconds().max(0))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .field("transport_session_id", &self.transport_session_id)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Table sizes, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub transport_bindings: usize,
    pub oauth_states: usize,
    pub auth_codes: usize,
}
