//! OAuth 2.1 endpoint handlers.
//!
//! Implements:
//! - RFC 9728: OAuth Protected Resource Metadata
//! - RFC 8414: OAuth Authorization Server Metadata
//! - RFC 7591: Dynamic Client Registration
//! - RFC 7636: PKCE (S256)
//! - RFC 6749: Authorization Code and Refresh Token Grants
//! - RFC 7009: Token Revocation
//!
//! An authorization attempt moves START → PENDING_UPSTREAM (user at Slack)
//! → CODE_ISSUED (our code handed to the client) → ACTIVE (bearer usable).

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Query, State, rejection::FormRejection, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, Cookie, authorization::Basic},
};
use chrono::{TimeDelta, Utc};
use serde::Deserialize;

use super::bearer::MCP_SESSION_HEADER;
use super::pkce::CodeChallengeMethod;
use super::types::{
    ClientMetadata, CodeGrant, NewSession, PendingAuthorization, Session, SessionKey, TokenPair,
    generate_token,
};
use crate::backup;
use crate::config::{Config, slack};
use crate::error::{AuthError, AuthResult, CodeFailure};
use crate::server::router::AppState;

/// Prefix of the cookie correlating the browser that started a flow with the
/// callback. Each flow gets its own cookie so concurrent flows from one
/// browser do not overwrite each other.
pub const FLOW_COOKIE: &str = "slack_mcp_oauth_flow";

/// Cookie name for the flow identified by `internal_state`.
pub fn flow_cookie_name(internal_state: &str) -> String {
    let prefix: String = internal_state.chars().take(16).collect();
    format!("{FLOW_COOKIE}_{prefix}")
}

/// Attributes shared by the set and clear forms of the flow cookie.
/// `Secure` is only sent when the public base URL is https.
fn flow_cookie_attributes(config: &Config, max_age: u64) -> String {
    let secure = if config.base_url.starts_with("https://") { " Secure;" } else { "" };
    format!("Path=/; Max-Age={max_age}; HttpOnly;{secure} SameSite=Lax")
}

// ─── RFC 9728: Protected Resource Metadata ───────────────────────────────────

/// `GET /.well-known/oauth-protected-resource`
pub async fn handle_protected_resource(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let base_url = &state.config.base_url;
    Json(serde_json::json!({
        "resource": base_url,
        "authorization_servers": [base_url],
        "bearer_methods_supported": ["header"],
        "scopes_supported": slack::USER_SCOPES
    }))
}

// ─── RFC 8414: Authorization Server Metadata ─────────────────────────────────

/// `GET /.well-known/oauth-authorization-server`
pub async fn handle_auth_server_metadata(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    Json(serde_json::json!({
        "issuer": config.base_url,
        "authorization_endpoint": config.endpoint("/oauth2/authorize"),
        "token_endpoint": config.endpoint("/oauth2/token"),
        "registration_endpoint": config.endpoint("/register"),
        "revocation_endpoint": config.endpoint("/oauth2/revoke"),
        "scopes_supported": slack::USER_SCOPES,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "client_secret_basic"],
        "revocation_endpoint_auth_methods_supported": ["client_secret_post", "client_secret_basic"],
        "pkce_required": true,
        "require_exact_redirect_uri": true
    }))
}

// ─── RFC 7591: Dynamic Client Registration ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub redirect_uris: Option<Vec<String>>,
    pub client_name: Option<String>,
    pub grant_types: Option<Vec<String>>,
    pub response_types: Option<Vec<String>>,
    pub scope: Option<String>,
    pub token_endpoint_auth_method: Option<String>,
}

/// `POST /register`
pub async fn handle_register(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> AuthResult<Response> {
    if state.register_limiter.check().is_err() {
        tracing::warn!("Client registration rate limit exceeded");
        return Err(AuthError::RateLimited);
    }

    let Json(req) = body.map_err(|e| AuthError::InvalidClientMetadata(e.body_text()))?;

    let client = state
        .registry
        .register(
            req.redirect_uris.unwrap_or_default(),
            ClientMetadata {
                client_name: req.client_name,
                grant_types: req.grant_types,
                response_types: req.response_types,
                scope: req.scope,
                token_endpoint_auth_method: req.token_endpoint_auth_method,
            },
        )
        .await?;

    let registration = &client.registration;
    Ok((
        StatusCode::CREATED,
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(serde_json::json!({
            "client_id": registration.client_id,
            "client_secret": client.client_secret,
            "client_id_issued_at": registration.created_at.timestamp(),
            "client_secret_expires_at": 0,
            "client_name": registration.client_name,
            "redirect_uris": registration.redirect_uris,
            "grant_types": registration.grant_types,
            "response_types": registration.response_types,
            "token_endpoint_auth_method": registration.token_endpoint_auth_method,
            "scope": registration.scope
        })),
    )
        .into_response())
}

// ─── START: Authorization Endpoint ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scope: Option<String>,
}

/// `GET /oauth2/authorize`
///
/// Validates the request, remembers it under a fresh internal state and
/// sends the browser to Slack.
pub async fn handle_authorize(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthorizeQuery>,
) -> AuthResult<Response> {
    let client_id = required(query.client_id, "client_id")?;
    let redirect_uri = required(query.redirect_uri, "redirect_uri")?;
    if query.response_type.as_deref() != Some("code") {
        return Err(AuthError::validation("response_type", "only response_type=code is supported"));
    }
    let external_state = required(query.state, "state")?;
    let (Some(code_challenge), Some(method)) = (
        query.code_challenge.filter(|c| !c.is_empty()),
        query.code_challenge_method.filter(|m| !m.is_empty()),
    ) else {
        return Err(AuthError::validation(
            "code_challenge",
            "PKCE required (code_challenge and code_challenge_method)",
        ));
    };
    let Some(method) = CodeChallengeMethod::parse(&method) else {
        return Err(AuthError::validation(
            "code_challenge_method",
            "only code_challenge_method=S256 is supported",
        ));
    };

    if !state.registry.validate_redirect_uri(&client_id, &redirect_uri).await? {
        tracing::warn!(client_id = %client_id, redirect_uri = %redirect_uri, "Rejected authorize request");
        return Err(AuthError::validation("client_id", "invalid client_id or redirect_uri"));
    }

    let Some(upstream) = state.upstream.clone() else {
        return Err(AuthError::UpstreamNotConfigured);
    };

    let internal_state = generate_token(32);
    let correlation_id = generate_token(32);
    let ttl = TimeDelta::from_std(state.config.state_ttl)
        .map_err(|e| AuthError::internal(format!("state ttl out of range: {e}")))?;

    state
        .sessions
        .store_oauth_state(
            internal_state.clone(),
            PendingAuthorization {
                bound_correlation_id: Some(correlation_id.clone()),
                code_challenge,
                code_challenge_method: method.as_str().to_string(),
                redirect_uri: state.config.upstream_redirect_uri(),
                scopes: query.scope.unwrap_or_else(slack::default_scope),
                external_state,
                client_id: client_id.clone(),
                external_redirect_uri: redirect_uri,
            },
            ttl,
        )
        .await?;

    tracing::info!(client_id = %client_id, "Redirecting to Slack for authorization");

    let cookie = format!(
        "{}={correlation_id}; {}",
        flow_cookie_name(&internal_state),
        flow_cookie_attributes(&state.config, state.config.state_ttl.as_secs())
    );
    Ok(found(upstream.authorization_url(&internal_state), Some(cookie)))
}

// ─── PENDING_UPSTREAM: Slack callback ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// `GET /oauth2/callback` (and the legacy `/oauth2callback`)
///
/// Consumes the internal state, exchanges Slack's code and hands our own
/// code back to the external client.
pub async fn handle_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    cookies: Option<TypedHeader<Cookie>>,
) -> AuthResult<Response> {
    let cookie_name = query.state.as_deref().map(flow_cookie_name);
    let correlation_id = cookies
        .as_ref()
        .zip(cookie_name.as_deref())
        .and_then(|(TypedHeader(c), name)| c.get(name));

    if let Some(error) = query.error {
        tracing::warn!(error = %error, "Slack returned an authorization error");
        if let Some(internal_state) = query.state.as_deref() {
            // Burn the state; it must not be usable after a denial.
            let _ = state.sessions.validate_and_consume_oauth_state(internal_state, correlation_id).await;
        }
        return Err(AuthError::AccessDenied(error));
    }

    let (Some(code), Some(internal_state)) = (
        query.code.filter(|c| !c.is_empty()),
        query.state.filter(|s| !s.is_empty()),
    ) else {
        return Err(AuthError::validation("code", "code and state required"));
    };

    let record = state
        .sessions
        .validate_and_consume_oauth_state(&internal_state, correlation_id)
        .await?;
    let pending = record.pending;

    let Some(upstream) = state.upstream.clone() else {
        return Err(AuthError::UpstreamNotConfigured);
    };

    // No store lock is held across this call.
    let grant = upstream.exchange_code(&code).await?;

    let our_code = generate_token(32);
    let ttl = TimeDelta::from_std(state.config.auth_code_ttl)
        .map_err(|e| AuthError::internal(format!("code ttl out of range: {e}")))?;
    state
        .sessions
        .store_authorization_code(
            our_code.clone(),
            CodeGrant {
                user_id: grant.user_id.clone(),
                team_id: grant.team_id.clone(),
                scopes: grant.scopes,
                code_challenge: Some(pending.code_challenge),
                client_id: pending.client_id.clone(),
                upstream: grant.credential,
            },
            ttl,
        )
        .await?;

    tracing::info!(
        client_id = %pending.client_id,
        user_id = %grant.user_id,
        team_id = %grant.team_id,
        "Issued authorization code"
    );

    let params = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("code", &our_code)
        .append_pair("state", &pending.external_state)
        .finish();
    let separator = if pending.external_redirect_uri.contains('?') { '&' } else { '?' };
    let location = format!("{}{separator}{params}", pending.external_redirect_uri);

    let clear = format!(
        "{}=; {}",
        flow_cookie_name(&internal_state),
        flow_cookie_attributes(&state.config, 0)
    );
    Ok(found(location, Some(clear)))
}

// ─── CODE_ISSUED / ACTIVE: Token Endpoint ────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

/// `POST /oauth2/token`
pub async fn handle_token(
    State(state): State<Arc<AppState>>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> AuthResult<Response> {
    let Form(form) = form.map_err(|e| AuthError::validation("body", e.body_text()))?;
    let basic = basic.map(|TypedHeader(auth)| auth);

    match form.grant_type.as_deref() {
        Some("authorization_code") => {
            authorization_code_grant(&state, form, basic.as_ref(), &headers).await
        }
        Some("refresh_token") => refresh_token_grant(&state, form, basic.as_ref()).await,
        Some(other) => Err(AuthError::UnsupportedGrantType(other.to_string())),
        None => Err(AuthError::validation("grant_type", "grant_type required")),
    }
}

async fn authorization_code_grant(
    state: &AppState,
    form: TokenRequest,
    basic: Option<&Authorization<Basic>>,
    headers: &HeaderMap,
) -> AuthResult<Response> {
    let code = required(form.code, "code")?;
    let (client_id, client_secret) =
        client_credentials(form.client_id, form.client_secret, basic)?;
    let code_verifier = required(form.code_verifier, "code_verifier")?;

    authenticate_client(state, &client_id, &client_secret).await?;

    if let Some(redirect_uri) = form.redirect_uri.as_deref() {
        if !state.registry.validate_redirect_uri(&client_id, redirect_uri).await? {
            return Err(AuthError::validation(
                "redirect_uri",
                "redirect_uri not registered for this client",
            ));
        }
    }

    let record = state.sessions.validate_and_consume_authorization_code(&code, &code_verifier).await?;
    let grant = record.grant;

    if grant.client_id != client_id {
        tracing::warn!(
            issued_to = %grant.client_id,
            presented_by = %client_id,
            "Authorization code presented by another client"
        );
        return Err(AuthError::InvalidCode(CodeFailure::ClientMismatch));
    }

    let transport_session_id = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let session = state
        .sessions
        .store_session(NewSession {
            key: SessionKey::new(&grant.team_id, &grant.user_id),
            tokens: TokenPair::generate(),
            token_type: "Bearer".to_string(),
            scopes: grant.scopes,
            expiry: Some(access_token_expiry(state)?.into()),
            session_id: format!("oauth_{}", uuid::Uuid::new_v4().simple()),
            transport_session_id,
            client_id,
            upstream: grant.upstream,
        })
        .await?;

    if let Some(backup) = &state.backup {
        backup::spawn_store(Arc::clone(backup), &session);
    }

    tracing::info!(
        user_id = %session.user_id(),
        team_id = %session.team_id(),
        client_id = %session.client_id,
        "Issued access token"
    );
    Ok(token_response(state, &session))
}

async fn refresh_token_grant(
    state: &AppState,
    form: TokenRequest,
    basic: Option<&Authorization<Basic>>,
) -> AuthResult<Response> {
    let refresh_token = required(form.refresh_token, "refresh_token")?;
    let (client_id, client_secret) =
        client_credentials(form.client_id, form.client_secret, basic)?;

    authenticate_client(state, &client_id, &client_secret).await?;

    let session = state
        .sessions
        .rotate_refresh_token(
            &refresh_token,
            &client_id,
            TokenPair::generate(),
            Some(access_token_expiry(state)?),
        )
        .await?;

    if let Some(backup) = &state.backup {
        backup::spawn_store(Arc::clone(backup), &session);
    }

    tracing::info!(
        user_id = %session.user_id(),
        team_id = %session.team_id(),
        "Refreshed access token"
    );
    Ok(token_response(state, &session))
}

// ─── REVOKED: RFC 7009 ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RevokeRequest {
    pub token: Option<String>,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// `POST /oauth2/revoke`
///
/// Unknown tokens still answer 200 so clients cannot probe for valid ones.
pub async fn handle_revoke(
    State(state): State<Arc<AppState>>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form: Result<Form<RevokeRequest>, FormRejection>,
) -> AuthResult<Response> {
    let Form(form) = form.map_err(|e| AuthError::validation("body", e.body_text()))?;
    let basic = basic.map(|TypedHeader(auth)| auth);

    let (client_id, client_secret) =
        client_credentials(form.client_id, form.client_secret, basic.as_ref())?;
    authenticate_client(&state, &client_id, &client_secret).await?;

    let token = required(form.token, "token")?;
    if let Some(session) = state.sessions.revoke_token(&token, &client_id).await {
        if let Some(backup) = &state.backup {
            backup::spawn_delete(Arc::clone(backup), session.key.clone());
        }
        tracing::info!(
            user_id = %session.user_id(),
            team_id = %session.team_id(),
            hint = form.token_type_hint.as_deref().unwrap_or("none"),
            "Token revoked"
        );
    }

    Ok((StatusCode::OK, [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))])
        .into_response())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn required(value: Option<String>, field: &str) -> AuthResult<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::validation(field, format!("{field} required")))
}

/// Resolve client credentials from the form (`client_secret_post`) or the
/// Authorization header (`client_secret_basic`).
fn client_credentials(
    form_id: Option<String>,
    form_secret: Option<String>,
    basic: Option<&Authorization<Basic>>,
) -> AuthResult<(String, String)> {
    if let Some(basic) = basic {
        if form_id.as_deref().is_some_and(|id| id != basic.username()) {
            return Err(AuthError::authentication("client_id does not match Basic credentials"));
        }
        return Ok((basic.username().to_string(), basic.password().to_string()));
    }
    let client_id = required(form_id, "client_id")?;
    Ok((client_id, form_secret.unwrap_or_default()))
}

async fn authenticate_client(state: &AppState, client_id: &str, client_secret: &str) -> AuthResult<()> {
    if state.registry.authenticate(client_id, client_secret).await? {
        Ok(())
    } else {
        tracing::warn!(client_id = %client_id, "Client authentication failed");
        Err(AuthError::authentication(format!("invalid credentials for {client_id}")))
    }
}

fn access_token_expiry(state: &AppState) -> AuthResult<chrono::DateTime<Utc>> {
    let lifetime = TimeDelta::from_std(state.config.access_token_lifetime)
        .map_err(|e| AuthError::internal(format!("token lifetime out of range: {e}")))?;
    Ok(Utc::now() + lifetime)
}

/// Token response with the cache headers RFC 6749 §5.1 requires.
fn token_response(state: &AppState, session: &Session) -> Response {
    let mut response = Json(serde_json::json!({
        "access_token": session.access_token,
        "token_type": session.token_type,
        "expires_in": state.config.access_token_lifetime.as_secs(),
        "refresh_token": session.refresh_token,
        "scope": session.scopes.join(" ")
    }))
    .into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// `302 Found`, optionally setting a cookie.
fn found(location: String, cookie: Option<String>) -> Response {
    let mut response = (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}
