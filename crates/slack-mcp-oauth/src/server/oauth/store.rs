//! Session store: OAuth states, authorization codes, sessions and
//! transport-session bindings.
//!
//! All four tables live behind one mutex and every public operation takes it
//! exactly once, so check-and-consume is atomic. Nothing here performs I/O
//! while the lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use super::expiry::{expiry_after, normalize_expiry};
use super::pkce;
use super::types::{
    AuthorizationCodeRecord, CodeGrant, NewSession, OAuthStateRecord, PendingAuthorization,
    Session, SessionKey, StoreStats, TokenPair, constant_time_eq, redact,
};
use crate::config::{oauth, slack};
use crate::error::{AuthError, AuthResult, CodeFailure, StateFailure};

#[derive(Default)]
struct Tables {
    oauth_states: HashMap<String, OAuthStateRecord>,
    auth_codes: HashMap<String, AuthorizationCodeRecord>,
    sessions: HashMap<SessionKey, Session>,
    bindings: HashMap<String, SessionKey>,
}

impl Tables {
    fn sweep_states(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.oauth_states.len();
        self.oauth_states.retain(|_, record| !record.is_expired(now));
        before - self.oauth_states.len()
    }

    fn sweep_codes(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.auth_codes.len();
        self.auth_codes.retain(|_, record| !record.is_expired(now));
        before - self.auth_codes.len()
    }

    /// Key of the session whose access token matches. Scans every session.
    fn find_by_access_token(&self, token: &str) -> Option<SessionKey> {
        let mut found = None;
        for (key, session) in &self.sessions {
            if constant_time_eq(&session.access_token, token) {
                found = Some(key.clone());
            }
        }
        found
    }

    /// Key of the session whose refresh token matches. Scans every session.
    fn find_by_refresh_token(&self, token: &str) -> Option<SessionKey> {
        let mut found = None;
        for (key, session) in &self.sessions {
            if constant_time_eq(&session.refresh_token, token) {
                found = Some(key.clone());
            }
        }
        found
    }

    fn remove_session(&mut self, key: &SessionKey) -> Option<Session> {
        let session = self.sessions.remove(key)?;
        self.bindings.retain(|_, bound| bound != key);
        Some(session)
    }

    /// Bind `transport_session_id` to `key`. First write wins.
    fn bind(&mut self, transport_session_id: &str, key: &SessionKey) -> AuthResult<()> {
        match self.bindings.get(transport_session_id) {
            Some(bound) if bound == key => Ok(()),
            Some(bound) => {
                tracing::warn!(
                    transport_session_id = redact(transport_session_id),
                    bound_to = %bound,
                    attempted = %key,
                    "Rejected transport session rebinding"
                );
                Err(AuthError::BindingConflict {
                    transport_session_id: transport_session_id.to_string(),
                })
            }
            None => {
                self.bindings.insert(transport_session_id.to_string(), key.clone());
                Ok(())
            }
        }
    }
}

/// Central store for the authorization server's short- and long-lived state.
pub struct SessionStore {
    tables: Mutex<Tables>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }

    // ─── OAuth states ────────────────────────────────────────────────────────

    /// Persist the state minted when a flow is sent to Slack.
    pub async fn store_oauth_state(
        &self,
        state: String,
        pending: PendingAuthorization,
        ttl: TimeDelta,
    ) -> AuthResult<OAuthStateRecord> {
        if state.is_empty() {
            return Err(AuthError::validation("state", "state must not be empty"));
        }
        if ttl < TimeDelta::zero() {
            return Err(AuthError::validation("ttl", "ttl must not be negative"));
        }

        let now = Utc::now();
        let record = OAuthStateRecord { state, pending, created_at: now, expires_at: now + ttl };

        let mut tables = self.tables.lock().await;
        let swept = tables.sweep_states(now);
        if swept > 0 {
            tracing::debug!(count = swept, "Swept expired OAuth states");
        }
        tables.oauth_states.insert(record.state.clone(), record.clone());
        Ok(record)
    }

    /// Consume an OAuth state.
    ///
    /// A found record whose bound correlation id is not presented is deleted
    /// anyway, so a leaked state cannot be replayed with the right cookie later.
    pub async fn validate_and_consume_oauth_state(
        &self,
        state: &str,
        correlation_id: Option<&str>,
    ) -> AuthResult<OAuthStateRecord> {
        if state.is_empty() {
            return Err(AuthError::InvalidState(StateFailure::NotFound));
        }

        let mut tables = self.tables.lock().await;
        let Some(record) = tables.oauth_states.remove(state) else {
            tracing::debug!(state = redact(state), "Unknown OAuth state");
            return Err(AuthError::InvalidState(StateFailure::NotFound));
        };

        if let Some(bound) = record.pending.bound_correlation_id.as_deref() {
            let matches = correlation_id.is_some_and(|supplied| constant_time_eq(bound, supplied));
            if !matches {
                tracing::warn!(
                    state = redact(state),
                    client_id = %record.pending.client_id,
                    correlation_present = correlation_id.is_some(),
                    "OAuth state correlation mismatch, state burned"
                );
                return Err(AuthError::InvalidState(StateFailure::Mismatch));
            }
        }

        if record.is_expired(Utc::now()) {
            tracing::debug!(state = redact(state), "Expired OAuth state");
            return Err(AuthError::InvalidState(StateFailure::Expired));
        }

        Ok(record)
    }

    // ─── Authorization codes ─────────────────────────────────────────────────

    /// Persist one of our authorization codes. A negative `ttl` yields a code
    /// that is already expired.
    pub async fn store_authorization_code(
        &self,
        code: String,
        grant: CodeGrant,
        ttl: TimeDelta,
    ) -> AuthResult<AuthorizationCodeRecord> {
        if code.is_empty() {
            return Err(AuthError::validation("code", "code must not be empty"));
        }

        let now = Utc::now();
        let record = AuthorizationCodeRecord {
            code,
            grant,
            created_at: now,
            expires_at: now + ttl,
            used: false,
        };

        self.tables.lock().await.auth_codes.insert(record.code.clone(), record.clone());
        Ok(record)
    }

    /// Redeem an authorization code.
    ///
    /// Checks run in order: existence, used flag, expiry, PKCE. Expired codes
    /// and PKCE failures are deleted. Success marks the code used under the
    /// same lock, so exactly one concurrent caller can win.
    pub async fn validate_and_consume_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> AuthResult<AuthorizationCodeRecord> {
        let mut tables = self.tables.lock().await;
        let Some(record) = tables.auth_codes.get_mut(code) else {
            tracing::debug!(code = redact(code), "Unknown authorization code");
            return Err(AuthError::InvalidCode(CodeFailure::NotFound));
        };

        if record.used {
            tracing::warn!(
                code = redact(code),
                client_id = %record.grant.client_id,
                user_id = %record.grant.user_id,
                "Authorization code replay"
            );
            return Err(AuthError::InvalidCode(CodeFailure::AlreadyUsed));
        }

        if record.is_expired(Utc::now()) {
            tracing::warn!(code = redact(code), "Expired authorization code presented");
            tables.auth_codes.remove(code);
            return Err(AuthError::InvalidCode(CodeFailure::Expired));
        }

        if let Some(challenge) = record.grant.code_challenge.as_deref().filter(|c| !c.is_empty()) {
            let failure = if code_verifier.is_empty() {
                Some(CodeFailure::PkceRequired)
            } else if pkce::verify_s256(code_verifier, challenge) {
                None
            } else {
                Some(CodeFailure::PkceMismatch)
            };
            if let Some(failure) = failure {
                tracing::warn!(
                    code = redact(code),
                    client_id = %record.grant.client_id,
                    reason = failure.as_str(),
                    "PKCE verification failed, code discarded"
                );
                tables.auth_codes.remove(code);
                return Err(AuthError::InvalidCode(failure));
            }
        }

        record.used = true;
        Ok(record.clone())
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    /// Create or overwrite the session for `new.key`, binding its transport
    /// session if one is given.
    pub async fn store_session(&self, new: NewSession) -> AuthResult<Session> {
        let mut tables = self.tables.lock().await;
        if let Some(transport_id) = new.transport_session_id.as_deref() {
            tables.bind(transport_id, &new.key)?;
        }

        let previous_transport =
            tables.sessions.get(&new.key).and_then(|s| s.transport_session_id.clone());
        let upstream_expires_at =
            new.upstream.expires_in.and_then(|secs| expiry_after(Utc::now(), secs));

        let session = Session {
            access_token: new.tokens.access_token,
            refresh_token: new.tokens.refresh_token,
            token_type: new.token_type,
            scopes: new.scopes,
            expiry: new.expiry.and_then(normalize_expiry),
            session_id: new.session_id,
            transport_session_id: new.transport_session_id.or(previous_transport),
            client_id: new.client_id,
            bot_user_id: new.upstream.bot_user_id,
            enterprise_id: new.upstream.enterprise_id,
            upstream_access_token: new.upstream.access_token,
            upstream_refresh_token: new.upstream.refresh_token,
            upstream_expires_at,
            issuer: slack::ISSUER.to_string(),
            key: new.key,
        };

        tables.sessions.insert(session.key.clone(), session.clone());
        tracing::info!(
            session = %session.key,
            session_id = %session.session_id,
            "Stored session"
        );
        Ok(session)
    }

    pub async fn get_session(&self, user_id: &str, team_id: &str) -> Option<Session> {
        let key = SessionKey::new(team_id, user_id);
        self.tables.lock().await.sessions.get(&key).cloned()
    }

    pub async fn get_session_by_transport_id(&self, transport_session_id: &str) -> Option<Session> {
        let tables = self.tables.lock().await;
        let key = tables.bindings.get(transport_session_id)?;
        tables.sessions.get(key).cloned()
    }

    /// Remove a session and every binding that points at it.
    pub async fn remove_session(&self, user_id: &str, team_id: &str) -> Option<Session> {
        let key = SessionKey::new(team_id, user_id);
        let removed = self.tables.lock().await.remove_session(&key);
        if removed.is_some() {
            tracing::info!(session = %key, "Removed session");
        }
        removed
    }

    /// Resolve an access token to its session. Expired sessions do not resolve.
    pub async fn resolve_bearer(&self, token: &str) -> Option<Session> {
        if token.is_empty() {
            return None;
        }
        let tables = self.tables.lock().await;
        let key = tables.find_by_access_token(token)?;
        let session = tables.sessions.get(&key)?;
        if session.is_expired(Utc::now()) {
            tracing::debug!(session = %key, "Bearer token expired");
            return None;
        }
        Some(session.clone())
    }

    /// Replace both tokens of the session owning `refresh_token`.
    ///
    /// The session must have been issued to `client_id`. The old refresh token
    /// stops working the moment this returns.
    pub async fn rotate_refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        new_tokens: TokenPair,
        expiry: Option<DateTime<Utc>>,
    ) -> AuthResult<Session> {
        if refresh_token.is_empty() {
            return Err(AuthError::InvalidRefreshToken);
        }

        let mut tables = self.tables.lock().await;
        let Some(key) = tables.find_by_refresh_token(refresh_token) else {
            tracing::debug!(refresh_token = redact(refresh_token), "Unknown refresh token");
            return Err(AuthError::InvalidRefreshToken);
        };
        let Some(session) = tables.sessions.get_mut(&key) else {
            return Err(AuthError::InvalidRefreshToken);
        };

        if !constant_time_eq(&session.client_id, client_id) {
            tracing::warn!(
                session = %key,
                owner = %session.client_id,
                presented_by = %client_id,
                "Refresh token presented by another client"
            );
            return Err(AuthError::InvalidRefreshToken);
        }

        session.access_token = new_tokens.access_token;
        session.refresh_token = new_tokens.refresh_token;
        session.expiry = expiry;
        tracing::info!(session = %key, "Rotated session tokens");
        Ok(session.clone())
    }

    /// Bind a transport session to an existing identity.
    pub async fn bind_transport_session(
        &self,
        transport_session_id: &str,
        key: &SessionKey,
    ) -> AuthResult<()> {
        if transport_session_id.is_empty() {
            return Err(AuthError::validation("Mcp-Session-Id", "must not be empty"));
        }
        let mut tables = self.tables.lock().await;
        tables.bind(transport_session_id, key)?;
        if let Some(session) = tables.sessions.get_mut(key) {
            if session.transport_session_id.is_none() {
                session.transport_session_id = Some(transport_session_id.to_string());
            }
        }
        Ok(())
    }

    /// Revoke the session owning `token`, which may be an access or refresh
    /// token. Only the client the session was issued to may revoke it.
    pub async fn revoke_token(&self, token: &str, client_id: &str) -> Option<Session> {
        if token.is_empty() {
            return None;
        }
        let mut tables = self.tables.lock().await;
        let key = tables
            .find_by_access_token(token)
            .or_else(|| tables.find_by_refresh_token(token))?;
        let owner = &tables.sessions.get(&key)?.client_id;
        if !constant_time_eq(owner, client_id) {
            tracing::warn!(
                session = %key,
                owner = %owner,
                presented_by = %client_id,
                "Revocation by a client that does not own the token ignored"
            );
            return None;
        }
        let removed = tables.remove_session(&key);
        if removed.is_some() {
            tracing::info!(session = %key, "Revoked session");
        }
        removed
    }

    // ─── Housekeeping ────────────────────────────────────────────────────────

    /// Purge expired states and codes. Returns how many records were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let states = tables.sweep_states(now);
        let codes = tables.sweep_codes(now);
        if states + codes > 0 {
            tracing::debug!(states, codes, "Cleaned up expired OAuth records");
        }
        states + codes
    }

    /// Start background cleanup of expired states and codes.
    pub fn start_cleanup_task(self: Arc<Self>) {
        self.start_cleanup_task_every(oauth::CLEANUP_INTERVAL);
    }

    /// Start background cleanup with a custom interval.
    pub fn start_cleanup_task_every(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.sweep_expired().await;
            }
        });
    }

    /// Table sizes.
    pub async fn stats(&self) -> StoreStats {
        let tables = self.tables.lock().await;
        StoreStats {
            sessions: tables.sessions.len(),
            transport_bindings: tables.bindings.len(),
            oauth_states: tables.oauth_states.len(),
            auth_codes: tables.auth_codes.len(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish()
    }
}
