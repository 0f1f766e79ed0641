//! Shared helpers for the HTTP-level tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use slack_mcp_oauth::backup::{MemoryTokenBackup, TokenBackup};
use slack_mcp_oauth::config::Config;
use slack_mcp_oauth::server::oauth::pkce;
use slack_mcp_oauth::server::oauth::registry::MemoryClientStore;
use slack_mcp_oauth::server::{AppState, create_router};
use slack_mcp_oauth::upstream::{SlackOAuthClient, UpstreamProvider};

pub const BASE_URL: &str = "https://auth.example.com";
pub const REDIRECT_URI: &str = "https://client.example/cb";
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const SLACK_CODE: &str = "code-alpha";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub backup: Arc<MemoryTokenBackup>,
}

/// Build an app whose Slack client talks to `slack_url`.
pub fn build_app_with(config: Config) -> TestApp {
    let backup = Arc::new(MemoryTokenBackup::new());
    let upstream: Arc<dyn UpstreamProvider> = Arc::new(SlackOAuthClient::new(&config).unwrap());
    let state = Arc::new(AppState::new(
        config,
        Arc::new(MemoryClientStore::new()),
        Some(upstream),
        Some(Arc::clone(&backup) as Arc<dyn TokenBackup>),
    ));
    TestApp { router: create_router(Arc::clone(&state)), state, backup }
}

pub fn build_app(slack_url: &str) -> TestApp {
    build_app_with(Config::for_testing(slack_url))
}

/// Slack mock answering `oauth.v2.access` for `code` with the given identity.
pub async fn mount_slack_user(server: &MockServer, code: &str, user_id: &str, team_id: &str) {
    Mock::given(method("POST"))
        .and(path("/api/oauth.v2.access"))
        .and(body_string_contains(format!("code={code}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "app_id": "A0001",
            "access_token": "xoxb-bot-token",
            "token_type": "bot",
            "bot_user_id": "B0001",
            "team": {"id": team_id, "name": "Acme"},
            "enterprise": null,
            "authed_user": {
                "id": user_id,
                "scope": "chat:write,channels:read",
                "access_token": format!("xoxp-{user_id}"),
                "token_type": "user",
                "refresh_token": format!("xoxe-{user_id}"),
                "expires_in": 43200
            }
        })))
        .mount(server)
        .await;
}

pub async fn mock_slack() -> MockServer {
    let server = MockServer::start().await;
    mount_slack_user(&server, SLACK_CODE, "U123", "T123").await;
    server
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn challenge(verifier: &str) -> String {
    pkce::challenge_s256(verifier)
}

pub fn location(response: &Response) -> url::Url {
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    url::Url::parse(location).unwrap()
}

pub fn query_param(url: &url::Url, name: &str) -> Option<String> {
    url.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
}

/// `name=value` part of the Set-Cookie header.
pub fn flow_cookie(response: &Response) -> String {
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

pub async fn register(router: &Router, redirect_uri: &str) -> (String, String) {
    let response = router
        .clone()
        .oneshot(
            Request::post("/register")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({"client_name": "Test Client", "redirect_uris": [redirect_uri]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    (
        json["client_id"].as_str().unwrap().to_string(),
        json["client_secret"].as_str().unwrap().to_string(),
    )
}

pub fn authorize_uri(client_id: &str, redirect_uri: &str, state: &str, verifier: &str) -> String {
    let query = serde_urlencoded::to_string([
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("state", state),
        ("code_challenge", &challenge(verifier)),
        ("code_challenge_method", "S256"),
    ])
    .unwrap();
    format!("/oauth2/authorize?{query}")
}

pub async fn get(router: &Router, uri: &str) -> Response {
    router.clone().oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap()
}

/// Start a flow. Returns the internal state Slack will echo and the flow cookie.
pub async fn authorize(router: &Router, client_id: &str, redirect_uri: &str) -> (String, String) {
    let response = get(router, &authorize_uri(client_id, redirect_uri, "client-state", VERIFIER)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let upstream = location(&response);
    (query_param(&upstream, "state").unwrap(), flow_cookie(&response))
}

pub async fn callback(router: &Router, internal_state: &str, cookie: Option<&str>, code: &str) -> Response {
    let query = serde_urlencoded::to_string([("code", code), ("state", internal_state)]).unwrap();
    let mut request = Request::get(format!("/oauth2/callback?{query}"));
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    router.clone().oneshot(request.body(Body::empty()).unwrap()).await.unwrap()
}

/// Run register → authorize → callback and return our authorization code.
pub async fn issue_code(router: &Router, client_id: &str, slack_code: &str) -> String {
    let (internal_state, cookie) = authorize(router, client_id, REDIRECT_URI).await;
    let response = callback(router, &internal_state, Some(&cookie), slack_code).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let redirect = location(&response);
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("client-state"));
    query_param(&redirect, "code").unwrap()
}

pub async fn post_form(router: &Router, uri: &str, form: &[(&str, &str)], extra: &[(&str, &str)]) -> Response {
    let mut request = Request::post(uri).header("Content-Type", "application/x-www-form-urlencoded");
    for (name, value) in extra {
        request = request.header(*name, *value);
    }
    router
        .clone()
        .oneshot(request.body(Body::from(serde_urlencoded::to_string(form).unwrap())).unwrap())
        .await
        .unwrap()
}

pub async fn exchange_code(
    router: &Router,
    client_id: &str,
    client_secret: &str,
    code: &str,
    verifier: &str,
) -> Response {
    post_form(
        router,
        "/oauth2/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code_verifier", verifier),
        ],
        &[],
    )
    .await
}

pub async fn get_me(router: &Router, access_token: &str, transport_session: Option<&str>) -> Response {
    let mut request = Request::get("/api/me").header(header::AUTHORIZATION, format!("Bearer {access_token}"));
    if let Some(id) = transport_session {
        request = request.header("Mcp-Session-Id", id);
    }
    router.clone().oneshot(request.body(Body::empty()).unwrap()).await.unwrap()
}
