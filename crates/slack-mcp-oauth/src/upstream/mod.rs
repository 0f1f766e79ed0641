//! Upstream identity provider: Slack's OAuth v2.
//!
//! Exactly one outbound call happens per authorization attempt
//! (`oauth.v2.access`). It runs with a bounded timeout and is never retried;
//! a failure is reported to the caller, who restarts the flow.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::{Config, slack};
use crate::error::UpstreamError;
use crate::server::oauth::types::UpstreamCredential;

/// Identity and credential obtained from a successful code exchange.
#[derive(Debug, Clone)]
pub struct UpstreamGrant {
    pub user_id: String,
    pub team_id: String,
    pub scopes: Vec<String>,
    pub credential: UpstreamCredential,
}

/// Provider the authorization server delegates user authentication to.
#[async_trait]
pub trait UpstreamProvider: Send + Sync + std::fmt::Debug {
    /// URL the user's browser is sent to, carrying our internal `state`.
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange the provider's code for a credential bound to an identity.
    async fn exchange_code(&self, code: &str) -> Result<UpstreamGrant, UpstreamError>;
}

/// Slack OAuth v2 client.
#[derive(Clone)]
pub struct SlackOAuthClient {
    client: Client,
    client_id: String,
    client_secret: String,
    authorize_url: Url,
    access_url: String,
    redirect_uri: String,
    timeout: Duration,
}

impl SlackOAuthClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if Slack credentials are missing, the authorize URL is
    /// malformed, or the HTTP client cannot be built.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let (Some(client_id), Some(client_secret)) =
            (config.slack_client_id.clone(), config.slack_client_secret.clone())
        else {
            anyhow::bail!("SLACK_OAUTH_CLIENT_ID and SLACK_OAUTH_CLIENT_SECRET must both be set");
        };

        let authorize_url = Url::parse(&config.slack_authorize_url)?;

        // No retry middleware: the exchange code is single-use upstream too.
        let client = Client::builder()
            .timeout(config.upstream_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            client_id,
            client_secret,
            authorize_url,
            access_url: format!("{}/oauth.v2.access", config.slack_api_url),
            redirect_uri: config.upstream_redirect_uri(),
            timeout: config.upstream_timeout,
        })
    }
}

impl std::fmt::Debug for SlackOAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackOAuthClient")
            .field("client_id", &self.client_id)
            .field("access_url", &self.access_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthedUser {
    id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

/// Response of `oauth.v2.access`.
#[derive(Debug, Deserialize)]
struct AccessResponse {
    ok: bool,
    error: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    bot_user_id: Option<String>,
    team: Option<IdRef>,
    enterprise: Option<IdRef>,
    #[serde(default)]
    authed_user: AuthedUser,
}

impl AccessResponse {
    /// Personal OAuth puts the user token under `authed_user`; fall back to
    /// the top-level token for older app configurations.
    fn into_grant(self) -> Result<UpstreamGrant, UpstreamError> {
        if !self.ok {
            return Err(UpstreamError::rejected(
                self.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        let team_id = self.team.and_then(|t| t.id).filter(|id| !id.is_empty());
        let user_id = self.authed_user.id.filter(|id| !id.is_empty());
        let access_token =
            self.authed_user.access_token.or(self.access_token).filter(|t| !t.is_empty());

        let (Some(team_id), Some(user_id), Some(access_token)) = (team_id, user_id, access_token)
        else {
            return Err(UpstreamError::invalid_response(
                "response lacks team id, user id or user access token",
            ));
        };

        let scopes = self
            .authed_user
            .scope
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(UpstreamGrant {
            user_id,
            team_id,
            scopes,
            credential: UpstreamCredential {
                access_token,
                refresh_token: self.authed_user.refresh_token.or(self.refresh_token),
                expires_in: self.authed_user.expires_in,
                bot_user_id: self.bot_user_id,
                enterprise_id: self.enterprise.and_then(|e| e.id),
            },
        })
    }
}

#[async_trait]
impl UpstreamProvider for SlackOAuthClient {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("user_scope", &slack::USER_SCOPES.join(","))
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", state);
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> Result<UpstreamGrant, UpstreamError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let response = self
            .client
            .post(&self.access_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), "Slack token exchange returned HTTP error");
            return Err(UpstreamError::rejected(format!("http_{}", status.as_u16())));
        }

        let body: AccessResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::invalid_response(format!("undecodable body: {e}"))
            }
        })?;

        let grant = body.into_grant();
        match &grant {
            Ok(grant) => tracing::info!(
                user_id = %grant.user_id,
                team_id = %grant.team_id,
                scopes = grant.scopes.len(),
                "Slack token exchange succeeded"
            ),
            Err(e) => tracing::error!(error = %e, "Slack token exchange failed"),
        }
        grant
    }
}

impl SlackOAuthClient {
    fn transport_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            tracing::error!(timeout = ?self.timeout, "Slack token exchange timed out");
            UpstreamError::Timeout(self.timeout)
        } else {
            tracing::error!(error = %e, "Slack token exchange transport error");
            UpstreamError::Http(e)
        }
    }
}
