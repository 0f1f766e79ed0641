//! Configuration for the Slack MCP OAuth server.

use std::path::PathBuf;
use std::time::Duration;

/// Lifetimes of the artifacts minted by the authorization server.
pub mod oauth {
    use std::time::Duration;

    /// OAuth state lifetime while the user is at Slack: 10 minutes.
    pub const STATE_TTL: Duration = Duration::from_secs(600);

    /// Authorization code lifetime: 10 minutes.
    pub const AUTH_CODE_TTL: Duration = Duration::from_secs(600);

    /// Access token lifetime: 1 hour.
    pub const ACCESS_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

    /// Cleanup interval for expired states and codes: 5 minutes.
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

    /// Default registrations accepted per minute.
    pub const REGISTRATION_RATE_PER_MINUTE: u32 = 30;

    /// Path of the upstream callback, relative to the public base URL.
    pub const CALLBACK_PATH: &str = "/oauth2/callback";
}

/// Slack endpoints and scopes.
pub mod slack {
    use std::time::Duration;

    /// Slack's user-facing authorize page.
    pub const AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";

    /// Slack Web API base URL (`oauth.v2.access` lives here).
    pub const API_URL: &str = "https://slack.com/api";

    /// Issuer recorded on every session.
    pub const ISSUER: &str = "https://slack.com";

    /// Timeout for the single outbound code exchange.
    pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// User scopes requested from Slack.
    pub const USER_SCOPES: &[&str] = &[
        "channels:history",
        "channels:read",
        "chat:write",
        "users:read",
        "users:read.email",
        "groups:history",
        "groups:read",
        "im:history",
        "im:read",
        "mpim:history",
        "mpim:read",
        "search:read",
        "reactions:read",
        "reactions:write",
        "files:read",
        "pins:read",
        "bookmarks:read",
        "stars:read",
    ];

    /// Scopes joined the way OAuth `scope` parameters expect.
    #[must_use]
    pub fn default_scope() -> String {
        USER_SCOPES.join(" ")
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct Config {
    /// Public base URL of this server (issuer and endpoint prefix).
    pub base_url: String,

    /// Slack app client ID.
    pub slack_client_id: Option<String>,

    /// Slack app client secret.
    pub slack_client_secret: Option<String>,

    /// Slack authorize page (overridable for tests).
    pub slack_authorize_url: String,

    /// Slack Web API base URL (overridable for tests).
    pub slack_api_url: String,

    /// Hosts dynamic clients may register redirect URIs for.
    pub allowed_redirect_hosts: Vec<String>,

    /// JSON file that persists client registrations. `None` keeps them in memory.
    pub clients_path: Option<PathBuf>,

    /// Object store base URL for the token backup. `None` disables the backup.
    pub token_backup_url: Option<String>,

    /// Bearer credential for the token backup store.
    pub token_backup_token: Option<String>,

    /// Timeout for the Slack code exchange.
    pub upstream_timeout: Duration,

    /// Connection timeout for outbound calls.
    pub connect_timeout: Duration,

    /// Registration quota per minute.
    pub registration_rate_per_minute: u32,

    /// OAuth state lifetime.
    pub state_ttl: Duration,

    /// Authorization code lifetime.
    pub auth_code_ttl: Duration,

    /// Access token lifetime.
    pub access_token_lifetime: Duration,
}

impl Config {
    /// Create a configuration for the given public base URL with defaults everywhere else.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base_url(base_url.into()),
            slack_client_id: None,
            slack_client_secret: None,
            slack_authorize_url: slack::AUTHORIZE_URL.to_string(),
            slack_api_url: slack::API_URL.to_string(),
            allowed_redirect_hosts: Vec::new(),
            clients_path: None,
            token_backup_url: None,
            token_backup_token: None,
            upstream_timeout: slack::UPSTREAM_TIMEOUT,
            connect_timeout: slack::CONNECT_TIMEOUT,
            registration_rate_per_minute: oauth::REGISTRATION_RATE_PER_MINUTE,
            state_ttl: oauth::STATE_TTL,
            auth_code_ttl: oauth::AUTH_CODE_TTL,
            access_token_lifetime: oauth::ACCESS_TOKEN_LIFETIME,
        }
    }

    /// Create a test configuration pointing Slack at a mock server.
    #[must_use]
    pub fn for_testing(upstream_url: &str) -> Self {
        Self {
            slack_client_id: Some("test-slack-client".to_string()),
            slack_client_secret: Some("test-slack-secret".to_string()),
            slack_authorize_url: format!("{upstream_url}/oauth/v2/authorize"),
            slack_api_url: format!("{upstream_url}/api"),
            allowed_redirect_hosts: vec!["client.example".to_string(), "localhost".to_string()],
            upstream_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            registration_rate_per_minute: 1000,
            ..Self::new("https://auth.example.com")
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env_var("PORT").or_else(|| env_var("SLACK_MCP_PORT"));
        let port: u16 = match port {
            Some(p) => p.parse().map_err(|e| anyhow::anyhow!("invalid PORT {p:?}: {e}"))?,
            None => 8000,
        };

        let base_url = env_var("SLACK_EXTERNAL_URL").unwrap_or_else(|| {
            let base_uri =
                env_var("SLACK_MCP_BASE_URI").unwrap_or_else(|| "http://localhost".to_string());
            format!("{base_uri}:{port}")
        });

        let mut config = Self::new(base_url);
        config.slack_client_id = env_var("SLACK_OAUTH_CLIENT_ID");
        config.slack_client_secret = env_var("SLACK_OAUTH_CLIENT_SECRET");
        if let Some(url) = env_var("SLACK_AUTHORIZE_URL") {
            config.slack_authorize_url = url;
        }
        if let Some(url) = env_var("SLACK_API_URL") {
            config.slack_api_url = trim_base_url(url);
        }
        config.allowed_redirect_hosts =
            parse_host_list(&env_var("ALLOWED_REDIRECT_HOSTS").unwrap_or_default());
        config.clients_path = env_var("DYNAMIC_CLIENTS_PATH").map(PathBuf::from);
        config.token_backup_url = env_var("TOKEN_BACKUP_URL").map(trim_base_url);
        config.token_backup_token = env_var("TOKEN_BACKUP_TOKEN");

        if let Some(secs) = env_var("UPSTREAM_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid UPSTREAM_TIMEOUT_SECS {secs:?}: {e}"))?;
            config.upstream_timeout = Duration::from_secs(secs);
        }
        if let Some(rate) = env_var("REGISTRATION_RATE_PER_MINUTE") {
            config.registration_rate_per_minute = rate.parse().map_err(|e| {
                anyhow::anyhow!("invalid REGISTRATION_RATE_PER_MINUTE {rate:?}: {e}")
            })?;
        }

        Ok(config)
    }

    /// Check if Slack client credentials are configured.
    #[must_use]
    pub fn upstream_configured(&self) -> bool {
        self.slack_client_id.is_some() && self.slack_client_secret.is_some()
    }

    /// Check if dynamic client registration is possible.
    #[must_use]
    pub fn registration_enabled(&self) -> bool {
        !self.allowed_redirect_hosts.is_empty()
    }

    /// Redirect URI registered with Slack.
    #[must_use]
    pub fn upstream_redirect_uri(&self) -> String {
        format!("{}{}", self.base_url, oauth::CALLBACK_PATH)
    }

    /// Build an absolute URL for one of our endpoints.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("slack_client_id", &self.slack_client_id)
            .field("has_slack_client_secret", &self.slack_client_secret.is_some())
            .field("slack_api_url", &self.slack_api_url)
            .field("allowed_redirect_hosts", &self.allowed_redirect_hosts)
            .field("clients_path", &self.clients_path)
            .field("token_backup_url", &self.token_backup_url)
            .field("has_token_backup_token", &self.token_backup_token.is_some())
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

/// Parse a comma-separated host list, dropping blanks.
#[must_use]
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn trim_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
