//! Error types for the Slack MCP OAuth server.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! Every [`AuthError`] knows its HTTP status and RFC 6749 error code, so handlers
//! can return it directly.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// Errors from the single outbound call to Slack.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Slack did not answer in time
    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),

    /// Slack answered `ok: false`
    #[error("Upstream rejected the exchange: {error}")]
    Rejected {
        /// Slack error code
        error: String,
    },

    /// Slack answered without the identity we need
    #[error("Invalid upstream response: {message}")]
    InvalidResponse {
        /// What was missing or malformed
        message: String,
    },
}

impl UpstreamError {
    /// Create a rejected error.
    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::Rejected { error: error.into() }
    }

    /// Create an invalid response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into() }
    }

    /// HTTP status reported to the client.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Errors from the durable token backup.
#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Middleware error (retries exhausted)
    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// Unexpected HTTP status from the object store
    #[error("Unexpected status {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },

    /// Stored object could not be decoded
    #[error("Failed to parse backup: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors from client registration persistence.
#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored registrations could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Why an OAuth state failed validation. Logged, never shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFailure {
    NotFound,
    Expired,
    Mismatch,
}

impl StateFailure {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Mismatch => "mismatch",
        }
    }
}

/// Why an authorization code failed validation. Logged, never shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeFailure {
    NotFound,
    AlreadyUsed,
    Expired,
    PkceRequired,
    PkceMismatch,
    /// Code was issued to a different client.
    ClientMismatch,
}

impl CodeFailure {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyUsed => "already_used",
            Self::Expired => "expired",
            Self::PkceRequired => "pkce_required",
            Self::PkceMismatch => "pkce_mismatch",
            Self::ClientMismatch => "client_mismatch",
        }
    }
}

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing fields.
    Validation,
    /// Bad client credentials or unresolvable bearer.
    Authentication,
    /// Forbidden redirect host or session-binding conflict.
    Authorization,
    /// State or code past its TTL.
    Expired,
    /// Already-consumed state or code.
    Replay,
    /// Slack exchange failed or timed out.
    Upstream,
    /// Feature not configured or rate limited.
    Unavailable,
    /// Everything else.
    Internal,
}

/// Errors surfaced by the authorization server.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    /// Missing or malformed request field
    #[error("Validation error: {field}: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Registration metadata rejected
    #[error("Invalid client metadata: {0}")]
    InvalidClientMetadata(String),

    /// Token endpoint grant type not supported
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// Client authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Bearer token did not resolve
    #[error("Invalid bearer token")]
    InvalidToken,

    /// Caller is not allowed to do this
    #[error("Forbidden: {0}")]
    Authorization(String),

    /// Transport session already belongs to another identity
    #[error("Transport session {transport_session_id} is already bound to a different identity")]
    BindingConflict {
        /// Transport session that was being rebound
        transport_session_id: String,
    },

    /// OAuth state validation failed
    #[error("Invalid OAuth state ({})", .0.as_str())]
    InvalidState(StateFailure),

    /// Authorization code validation failed
    #[error("Invalid authorization code ({})", .0.as_str())]
    InvalidCode(CodeFailure),

    /// Refresh token unknown or owned by another client
    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    /// User or Slack denied the authorization
    #[error("Access denied by upstream: {0}")]
    AccessDenied(String),

    /// Slack exchange failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Feature is switched off by configuration
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Slack client credentials are missing
    #[error("Slack OAuth is not configured")]
    UpstreamNotConfigured,

    /// Too many requests
    #[error("Rate limited")]
    RateLimited,

    /// Client registration could not be persisted or loaded
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Create an authentication error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Create an authorization error.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Position in the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::InvalidClientMetadata(_)
            | Self::UnsupportedGrantType(_)
            | Self::InvalidRefreshToken
            | Self::AccessDenied(_) => ErrorKind::Validation,
            Self::Authentication(_) | Self::InvalidToken => ErrorKind::Authentication,
            Self::Authorization(_) | Self::BindingConflict { .. } => ErrorKind::Authorization,
            Self::InvalidState(StateFailure::Expired) | Self::InvalidCode(CodeFailure::Expired) => {
                ErrorKind::Expired
            }
            Self::InvalidCode(CodeFailure::AlreadyUsed) => ErrorKind::Replay,
            Self::InvalidState(_) | Self::InvalidCode(_) => ErrorKind::Validation,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::NotConfigured(_) | Self::RateLimited => ErrorKind::Unavailable,
            Self::UpstreamNotConfigured | Self::Persistence(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP status reported to the client.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. }
            | Self::InvalidClientMetadata(_)
            | Self::UnsupportedGrantType(_)
            | Self::InvalidState(_)
            | Self::InvalidCode(_)
            | Self::InvalidRefreshToken
            | Self::AccessDenied(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) | Self::BindingConflict { .. } => StatusCode::FORBIDDEN,
            Self::Upstream(e) => e.status(),
            Self::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamNotConfigured | Self::Persistence(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// OAuth error code (RFC 6749 §5.2, RFC 7591 §3.2.2, RFC 6750 §3.1).
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::InvalidState(_) => "invalid_request",
            Self::InvalidClientMetadata(_) => "invalid_client_metadata",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::Authentication(_) => "invalid_client",
            Self::InvalidToken => "invalid_token",
            Self::Authorization(_) | Self::BindingConflict { .. } | Self::AccessDenied(_) => {
                "access_denied"
            }
            Self::InvalidCode(_) | Self::InvalidRefreshToken => "invalid_grant",
            Self::NotConfigured(_) => "temporarily_unavailable",
            Self::RateLimited => "slow_down",
            Self::Upstream(_) | Self::UpstreamNotConfigured | Self::Persistence(_) | Self::Internal(_) => {
                "server_error"
            }
        }
    }

    /// Description safe to show the client.
    ///
    /// State and code failures collapse to one message so callers cannot probe
    /// whether a guessed value exists, expired, or was already used.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Validation { field, message } => format!("{field}: {message}"),
            Self::InvalidClientMetadata(message) | Self::Authorization(message) => message.clone(),
            Self::UnsupportedGrantType(grant) => format!("Unsupported grant_type: {grant}"),
            Self::Authentication(_) => "Invalid client credentials".to_string(),
            Self::InvalidToken => "Valid OAuth bearer token required".to_string(),
            Self::BindingConflict { .. } => {
                "Session is already bound to a different identity".to_string()
            }
            Self::InvalidState(_) => "Invalid or expired OAuth state parameter".to_string(),
            Self::InvalidCode(_) => "Invalid authorization code".to_string(),
            Self::InvalidRefreshToken => "Invalid refresh_token".to_string(),
            Self::AccessDenied(error) => format!("Slack OAuth error: {error}"),
            Self::Upstream(UpstreamError::Rejected { error }) => {
                format!("Slack token exchange failed: {error}")
            }
            Self::Upstream(UpstreamError::Timeout(_)) => "Slack token exchange timed out".to_string(),
            Self::Upstream(UpstreamError::InvalidResponse { .. }) => {
                "Invalid Slack token response".to_string()
            }
            Self::Upstream(UpstreamError::Http(_)) => "Slack token exchange failed".to_string(),
            Self::NotConfigured(message) => message.clone(),
            Self::UpstreamNotConfigured => "Slack OAuth not configured".to_string(),
            Self::RateLimited => "Too many requests, slow down".to_string(),
            Self::Persistence(_) | Self::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut response = (
            status,
            Json(serde_json::json!({
                "error": self.error_code(),
                "error_description": self.description(),
            })),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if matches!(self, Self::Authentication(_)) {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="slack-mcp""#),
            );
        }
        response
    }
}

/// Result type alias for authorization server operations.
pub type AuthResult<T> = Result<T, AuthError>;
