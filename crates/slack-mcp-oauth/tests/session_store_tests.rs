//! Session store guarantees: single use, burn-on-mismatch, binding and
//! rotation under concurrency.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use futures::future::join_all;

use slack_mcp_oauth::error::{AuthError, CodeFailure, ErrorKind, StateFailure};
use slack_mcp_oauth::server::oauth::pkce::challenge_s256;
use slack_mcp_oauth::server::oauth::store::SessionStore;
use slack_mcp_oauth::server::oauth::types::{
    CodeGrant, NewSession, PendingAuthorization, SessionKey, TokenPair, UpstreamCredential,
};

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn pending(correlation: Option<&str>) -> PendingAuthorization {
    PendingAuthorization {
        bound_correlation_id: correlation.map(str::to_string),
        code_challenge: challenge_s256(VERIFIER),
        code_challenge_method: "S256".into(),
        redirect_uri: "https://auth.example.com/oauth2/callback".into(),
        scopes: "chat:write".into(),
        external_state: "client-state".into(),
        client_id: "client-a".into(),
        external_redirect_uri: "https://client.example/cb".into(),
    }
}

fn grant(challenge: Option<String>) -> CodeGrant {
    CodeGrant {
        user_id: "U1".into(),
        team_id: "T1".into(),
        scopes: vec!["chat:write".into()],
        code_challenge: challenge,
        client_id: "client-a".into(),
        upstream: UpstreamCredential { access_token: "xoxp-1".into(), ..Default::default() },
    }
}

fn new_session(user: &str, transport: Option<&str>) -> NewSession {
    NewSession {
        key: SessionKey::new("T1", user),
        tokens: TokenPair::generate(),
        token_type: "Bearer".into(),
        scopes: vec!["chat:write".into()],
        expiry: Some((Utc::now() + TimeDelta::hours(1)).into()),
        session_id: format!("oauth_{user}"),
        transport_session_id: transport.map(str::to_string),
        client_id: "client-a".into(),
        upstream: UpstreamCredential { access_token: format!("xoxp-{user}"), ..Default::default() },
    }
}

// ─── OAuth states ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_consumed_once() {
    let store = SessionStore::new();
    store.store_oauth_state("s1".into(), pending(Some("c1")), TimeDelta::minutes(10)).await.unwrap();

    let record = store.validate_and_consume_oauth_state("s1", Some("c1")).await.unwrap();
    assert_eq!(record.pending.external_state, "client-state");

    let again = store.validate_and_consume_oauth_state("s1", Some("c1")).await.unwrap_err();
    assert!(matches!(again, AuthError::InvalidState(StateFailure::NotFound)));
}

#[tokio::test]
async fn test_state_mismatch_burns_record() {
    let store = SessionStore::new();
    store.store_oauth_state("s1".into(), pending(Some("c1")), TimeDelta::minutes(10)).await.unwrap();

    let err = store.validate_and_consume_oauth_state("s1", Some("c2")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(StateFailure::Mismatch)));

    let err = store.validate_and_consume_oauth_state("s1", Some("c1")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(StateFailure::NotFound)));
}

#[tokio::test]
async fn test_state_missing_correlation_burns_record() {
    let store = SessionStore::new();
    store.store_oauth_state("s1".into(), pending(Some("c1")), TimeDelta::minutes(10)).await.unwrap();

    let err = store.validate_and_consume_oauth_state("s1", None).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(StateFailure::Mismatch)));
    assert_eq!(store.stats().await.oauth_states, 0);
}

#[tokio::test]
async fn test_unbound_state_accepts_any_correlation() {
    let store = SessionStore::new();
    store.store_oauth_state("s1".into(), pending(None), TimeDelta::minutes(10)).await.unwrap();
    assert!(store.validate_and_consume_oauth_state("s1", None).await.is_ok());
}

#[tokio::test]
async fn test_state_with_zero_ttl_is_expired() {
    let store = SessionStore::new();
    store.store_oauth_state("s1".into(), pending(Some("c1")), TimeDelta::zero()).await.unwrap();

    let err = store.validate_and_consume_oauth_state("s1", Some("c1")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(StateFailure::Expired)));
    assert_eq!(store.stats().await.oauth_states, 0);
}

#[tokio::test]
async fn test_state_rejects_negative_ttl() {
    let store = SessionStore::new();
    let err = store
        .store_oauth_state("s1".into(), pending(None), TimeDelta::seconds(-1))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Validation { .. }));
}

#[tokio::test]
async fn test_storing_state_sweeps_expired_ones() {
    let store = SessionStore::new();
    store.store_oauth_state("old".into(), pending(None), TimeDelta::zero()).await.unwrap();
    store.store_oauth_state("new".into(), pending(None), TimeDelta::minutes(10)).await.unwrap();
    assert_eq!(store.stats().await.oauth_states, 1);
}

// ─── Authorization codes ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_state_consumption_has_one_winner() {
    let store = Arc::new(SessionStore::new());
    store.store_oauth_state("s1".into(), pending(Some("A")), TimeDelta::minutes(10)).await.unwrap();

    let attempts = (0..32).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.validate_and_consume_oauth_state("s1", Some("A")).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AuthError::InvalidState(StateFailure::NotFound)))
    );
    assert_eq!(store.stats().await.oauth_states, 0);
}

#[tokio::test]
async fn test_code_without_challenge_is_single_use() {
    let store = SessionStore::new();
    store.store_authorization_code("k1".into(), grant(None), TimeDelta::minutes(10)).await.unwrap();

    let record = store.validate_and_consume_authorization_code("k1", "").await.unwrap();
    assert!(record.used);

    let err = store.validate_and_consume_authorization_code("k1", "").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::AlreadyUsed)));
    assert_eq!(err.kind(), ErrorKind::Replay);
}

#[tokio::test]
async fn test_code_with_negative_ttl_is_expired() {
    let store = SessionStore::new();
    store
        .store_authorization_code("k1".into(), grant(None), TimeDelta::seconds(-1))
        .await
        .unwrap();

    let err = store.validate_and_consume_authorization_code("k1", "").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::Expired)));
    assert_eq!(err.kind(), ErrorKind::Expired);

    let err = store.validate_and_consume_authorization_code("k1", "").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::NotFound)));
}

#[tokio::test]
async fn test_pkce_required_when_challenge_stored() {
    let store = SessionStore::new();
    store
        .store_authorization_code("k1".into(), grant(Some(challenge_s256(VERIFIER))), TimeDelta::minutes(10))
        .await
        .unwrap();

    let err = store.validate_and_consume_authorization_code("k1", "").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::PkceRequired)));
    assert_eq!(store.stats().await.auth_codes, 0);
}

#[tokio::test]
async fn test_pkce_mismatch_deletes_code() {
    let store = SessionStore::new();
    store
        .store_authorization_code("k1".into(), grant(Some(challenge_s256(VERIFIER))), TimeDelta::minutes(10))
        .await
        .unwrap();

    let err = store.validate_and_consume_authorization_code("k1", "wrong").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::PkceMismatch)));

    let err = store.validate_and_consume_authorization_code("k1", VERIFIER).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::NotFound)));
}

#[tokio::test]
async fn test_concurrent_code_redemption_has_one_winner() {
    let store = Arc::new(SessionStore::new());
    store
        .store_authorization_code("k1".into(), grant(Some(challenge_s256(VERIFIER))), TimeDelta::minutes(10))
        .await
        .unwrap();

    let attempts = (0..32).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.validate_and_consume_authorization_code("k1", VERIFIER).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.kind() == ErrorKind::Replay)
    );
}

#[tokio::test]
async fn test_sweep_removes_only_expired_records() {
    let store = SessionStore::new();
    store.store_authorization_code("live".into(), grant(None), TimeDelta::minutes(10)).await.unwrap();
    store.store_authorization_code("dead".into(), grant(None), TimeDelta::seconds(-5)).await.unwrap();
    store.store_oauth_state("live".into(), pending(None), TimeDelta::minutes(10)).await.unwrap();
    store.validate_and_consume_authorization_code("live", "").await.unwrap();

    assert_eq!(store.sweep_expired().await, 1);
    let stats = store.stats().await;
    assert_eq!(stats.auth_codes, 1);
    assert_eq!(stats.oauth_states, 1);

    // A used code survives the sweep until it expires, so replays stay visible.
    let err = store.validate_and_consume_authorization_code("live", "").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode(CodeFailure::AlreadyUsed)));
}

// ─── Sessions and bindings ───────────────────────────────────────────────────

#[tokio::test]
async fn test_binding_conflict_keeps_first_identity() {
    let store = SessionStore::new();
    store.store_session(new_session("U1", Some("conn-1"))).await.unwrap();

    let err = store.store_session(new_session("U2", Some("conn-1"))).await.unwrap_err();
    assert!(matches!(err, AuthError::BindingConflict { .. }));
    assert!(store.get_session("U2", "T1").await.is_none());

    let bound = store.get_session_by_transport_id("conn-1").await.unwrap();
    assert_eq!(bound.user_id(), "U1");
}

#[tokio::test]
async fn test_concurrent_binding_has_one_winner() {
    let store = Arc::new(SessionStore::new());

    let attempts = (0..32).map(|i| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.store_session(new_session(&format!("U{i}"), Some("conn-1"))).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AuthError::BindingConflict { .. }))
    );

    let bound = store.get_session_by_transport_id("conn-1").await.unwrap();
    assert_eq!(bound.key, winners[0].key);
    assert_eq!(store.stats().await.sessions, 1);
}

#[tokio::test]
async fn test_rebinding_same_identity_is_idempotent() {
    let store = SessionStore::new();
    let session = store.store_session(new_session("U1", Some("conn-1"))).await.unwrap();
    store.bind_transport_session("conn-1", &session.key).await.unwrap();
    store.store_session(new_session("U1", Some("conn-1"))).await.unwrap();
    assert_eq!(store.stats().await.transport_bindings, 1);
}

#[tokio::test]
async fn test_new_session_keeps_previous_transport() {
    let store = SessionStore::new();
    store.store_session(new_session("U1", Some("conn-1"))).await.unwrap();
    let replaced = store.store_session(new_session("U1", None)).await.unwrap();
    assert_eq!(replaced.transport_session_id.as_deref(), Some("conn-1"));
}

#[tokio::test]
async fn test_resolve_bearer() {
    let store = SessionStore::new();
    let session = store.store_session(new_session("U1", None)).await.unwrap();

    let resolved = store.resolve_bearer(&session.access_token).await.unwrap();
    assert_eq!(resolved.key, session.key);
    assert!(store.resolve_bearer(&session.refresh_token).await.is_none());
    assert!(store.resolve_bearer("").await.is_none());
}

#[tokio::test]
async fn test_expired_session_does_not_resolve() {
    let store = SessionStore::new();
    let mut new = new_session("U1", None);
    new.expiry = Some((Utc::now() - TimeDelta::seconds(1)).into());
    let session = store.store_session(new).await.unwrap();
    assert!(store.resolve_bearer(&session.access_token).await.is_none());
}

#[tokio::test]
async fn test_remove_session_drops_bindings() {
    let store = SessionStore::new();
    store.store_session(new_session("U1", Some("conn-1"))).await.unwrap();

    assert!(store.remove_session("U1", "T1").await.is_some());
    assert!(store.get_session_by_transport_id("conn-1").await.is_none());
    assert_eq!(store.stats().await.transport_bindings, 0);

    // The connection is free for someone else now.
    store.store_session(new_session("U2", Some("conn-1"))).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_refresh_has_one_winner() {
    let store = Arc::new(SessionStore::new());
    let session = store.store_session(new_session("U1", None)).await.unwrap();
    let refresh_token = Arc::new(session.refresh_token);

    let attempts = (0..16).map(|_| {
        let store = Arc::clone(&store);
        let refresh_token = Arc::clone(&refresh_token);
        tokio::spawn(async move {
            store
                .rotate_refresh_token(&refresh_token, "client-a", TokenPair::generate(), None)
                .await
        })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[tokio::test]
async fn test_rotate_rejects_foreign_client() {
    let store = SessionStore::new();
    let session = store.store_session(new_session("U1", None)).await.unwrap();

    let err = store
        .rotate_refresh_token(&session.refresh_token, "client-b", TokenPair::generate(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRefreshToken));
    assert!(store.resolve_bearer(&session.access_token).await.is_some());
}

#[tokio::test]
async fn test_revoke_by_refresh_token() {
    let store = SessionStore::new();
    let session = store.store_session(new_session("U1", Some("conn-1"))).await.unwrap();

    assert!(store.revoke_token(&session.refresh_token, "client-b").await.is_none());
    assert!(store.get_session("U1", "T1").await.is_some());

    let revoked = store.revoke_token(&session.refresh_token, "client-a").await.unwrap();
    assert_eq!(revoked.key, session.key);
    assert!(store.resolve_bearer(&session.access_token).await.is_none());
    assert!(store.get_session_by_transport_id("conn-1").await.is_none());
    assert!(store.revoke_token(&session.access_token, "client-a").await.is_none());
}

#[tokio::test]
async fn test_cleanup_task_sweeps_in_background() {
    let store = Arc::new(SessionStore::new());
    store.store_authorization_code("dead".into(), grant(None), TimeDelta::seconds(-5)).await.unwrap();
    Arc::clone(&store).start_cleanup_task_every(std::time::Duration::from_millis(10));

    for _ in 0..50 {
        if store.stats().await.auth_codes == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("cleanup task never swept the expired code");
}
