//! Bearer authentication for protected calls (RFC 6750).
//!
//! Handlers that need the caller's identity take an [`AuthenticatedSession`]
//! argument; the session is resolved from the request and passed in, never
//! looked up from ambient state.

use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderValue, header, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use chrono::Utc;

use super::types::Session;
use crate::error::AuthError;
use crate::server::router::AppState;

/// Transport session header sent by MCP clients.
pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// A request whose bearer token resolved to a live session.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession(pub Session);

/// Rejection for protected calls.
#[derive(Debug)]
pub struct BearerRejection {
    error: AuthError,
    resource_metadata: String,
    /// Whether the request carried credentials at all.
    presented: bool,
}

impl IntoResponse for BearerRejection {
    fn into_response(self) -> Response {
        let unauthorized = matches!(self.error, AuthError::InvalidToken);
        let mut response = self.error.into_response();
        if unauthorized {
            let challenge = if self.presented {
                format!(
                    r#"Bearer resource_metadata="{}", error="invalid_token""#,
                    self.resource_metadata
                )
            } else {
                format!(r#"Bearer resource_metadata="{}""#, self.resource_metadata)
            };
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

impl FromRequestParts<Arc<AppState>> for AuthenticatedSession {
    type Rejection = BearerRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let reject = |error: AuthError, presented: bool| BearerRejection {
            error,
            resource_metadata: state.config.endpoint("/.well-known/oauth-protected-resource"),
            presented,
        };

        let presented = parts.headers.contains_key(header::AUTHORIZATION);
        let TypedHeader(authorization) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| reject(AuthError::InvalidToken, presented))?;

        let Some(mut session) = state.sessions.resolve_bearer(authorization.token()).await else {
            tracing::debug!("Bearer token did not resolve");
            return Err(reject(AuthError::InvalidToken, true));
        };

        let transport_session_id = parts
            .headers
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        if let Some(transport_session_id) = transport_session_id {
            state
                .sessions
                .bind_transport_session(transport_session_id, &session.key)
                .await
                .map_err(|e| reject(e, true))?;
            session.transport_session_id.get_or_insert_with(|| transport_session_id.to_string());
        }

        Ok(Self(session))
    }
}

/// `GET /api/me`
///
/// Identity behind the presented bearer token.
pub async fn handle_me(AuthenticatedSession(session): AuthenticatedSession) -> impl IntoResponse {
    Json(serde_json::json!({
        "user_id": session.user_id(),
        "team_id": session.team_id(),
        "session_id": session.session_id,
        "client_id": session.client_id,
        "scopes": session.scopes,
        "expires_in": session.expires_in(Utc::now()),
        "transport_session_id": session.transport_session_id,
        "bot_user_id": session.bot_user_id,
        "enterprise_id": session.enterprise_id,
        "issuer": session.issuer
    }))
}
