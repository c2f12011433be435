mod common;

use axum::http::StatusCode;
use common::{
    FaultyStore, TestApp, ADMIN_ID, MEMBER_EMAIL, MEMBER_ID, OAUTH_EMAIL, OAUTH_USER_ID, PASSWORD,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use token_service::services::{InMemoryTokenStore, TokenPair};

async fn login(app: &TestApp, email: &str, password: &str) -> TokenPair {
    let res = app
        .post(
            "/auth/login",
            None,
            json!({ "email": email, "password": password }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK, "login failed: {}", res.body);
    serde_json::from_value(res.body).unwrap()
}

#[tokio::test]
async fn password_login_issues_a_usable_pair() {
    let app = TestApp::spawn().await;
    let pair = login(&app, "Alice@Example.TEST", PASSWORD).await;

    assert_eq!(pair.token_type, "Bearer");
    assert_eq!(pair.expires_in, 15 * 60);

    let me = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["user_id"], MEMBER_ID);
    assert_eq!(me.body["role"], "member");
    assert_eq!(me.body["session_id"], pair.session_id.to_string());
    assert!(app.audit_types().await.contains(&"user_login".to_string()));
}

#[tokio::test]
async fn failed_logins_are_indistinguishable() {
    let app = TestApp::spawn().await;

    let wrong_password = app
        .post(
            "/auth/login",
            None,
            json!({ "email": MEMBER_EMAIL, "password": "not the password" }),
        )
        .await;
    let unknown_user = app
        .post(
            "/auth/login",
            None,
            json!({ "email": "nobody@example.test", "password": PASSWORD }),
        )
        .await;
    let oauth_account = app
        .post(
            "/auth/login",
            None,
            json!({ "email": OAUTH_EMAIL, "password": PASSWORD }),
        )
        .await;

    for res in [&wrong_password, &unknown_user, &oauth_account] {
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.body["error"], "Invalid credentials");
    }
}

#[tokio::test]
async fn refresh_rotates_and_old_refresh_token_stops_working() {
    let app = TestApp::spawn().await;
    let original = app.tokens_for(MEMBER_ID).await;

    let res = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": original.refresh_token }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let rotated: TokenPair = serde_json::from_value(res.body).unwrap();

    assert_eq!(rotated.session_id, original.session_id);
    assert_ne!(rotated.refresh_token, original.refresh_token);
    assert_eq!(
        app.get("/auth/me", Some(&rotated.access_token)).await.status,
        StatusCode::OK
    );

    let second = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": rotated.refresh_token }),
        )
        .await;
    assert_eq!(second.status, StatusCode::OK);
}

#[tokio::test]
async fn replayed_refresh_token_revokes_the_whole_session() {
    let app = TestApp::spawn().await;
    let original = app.tokens_for(MEMBER_ID).await;
    let other_session = app.tokens_for(MEMBER_ID).await;

    let res = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": original.refresh_token }),
        )
        .await;
    let rotated: TokenPair = serde_json::from_value(res.body).unwrap();

    // The superseded token comes back.
    let replay = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": original.refresh_token }),
        )
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);

    let after_reuse = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": rotated.refresh_token }),
        )
        .await;
    assert_eq!(after_reuse.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        app.get("/auth/me", Some(&rotated.access_token)).await.status,
        StatusCode::UNAUTHORIZED
    );

    assert_eq!(
        app.get("/auth/me", Some(&other_session.access_token))
            .await
            .status,
        StatusCode::OK
    );
    assert!(app
        .audit_types()
        .await
        .contains(&"refresh_reuse_detected".to_string()));
    assert!(app.state.metrics.render().contains("refresh_reuse_detected_total 1"));
}

#[tokio::test]
async fn concurrent_refresh_of_one_token_never_yields_two_live_chains() {
    let app = TestApp::spawn().await;
    let original = app.tokens_for(MEMBER_ID).await;
    let body = json!({ "refresh_token": original.refresh_token });

    let (a, b) = tokio::join!(
        app.post("/auth/refresh", None, body.clone()),
        app.post("/auth/refresh", None, body.clone()),
    );

    let winners = [&a, &b]
        .iter()
        .filter(|r| r.status == StatusCode::OK)
        .count();
    assert!(winners <= 1);

    if winners == 1 {
        // The loser was treated as reuse, so the winner's chain is dead too.
        let winner = if a.status == StatusCode::OK { &a } else { &b };
        let pair: TokenPair = serde_json::from_value(winner.body.clone()).unwrap();
        let next = app
            .post(
                "/auth/refresh",
                None,
                json!({ "refresh_token": pair.refresh_token }),
            )
            .await;
        assert_eq!(next.status, StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn access_token_cannot_be_used_to_refresh() {
    let app = TestApp::spawn().await;
    let pair = app.tokens_for(MEMBER_ID).await;

    let res = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": pair.access_token }),
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "Invalid or expired token");
}

#[tokio::test]
async fn logout_kills_access_and_refresh_of_that_session_only() {
    let app = TestApp::spawn().await;
    let current = app.tokens_for(MEMBER_ID).await;
    let elsewhere = app.tokens_for(MEMBER_ID).await;

    let res = app
        .send(
            axum::http::Method::POST,
            "/auth/logout",
            Some(&current.access_token),
            None,
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);

    assert_eq!(
        app.get("/auth/me", Some(&current.access_token)).await.status,
        StatusCode::UNAUTHORIZED
    );
    let refresh = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": current.refresh_token }),
        )
        .await;
    assert_eq!(refresh.status, StatusCode::UNAUTHORIZED);

    assert_eq!(
        app.get("/auth/me", Some(&elsewhere.access_token)).await.status,
        StatusCode::OK
    );

    let logged_out = app
        .state
        .blacklist
        .get_tokens_by_reason(
            token_service::models::RevocationReason::Logout,
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(logged_out.total, 2);
}

#[tokio::test]
async fn logout_all_revokes_every_session() {
    let app = TestApp::spawn().await;
    let a = app.tokens_for(MEMBER_ID).await;
    let b = app.tokens_for(MEMBER_ID).await;
    let admin = app.tokens_for(ADMIN_ID).await;

    let res = app
        .send(
            axum::http::Method::POST,
            "/auth/logout-all",
            Some(&a.access_token),
            None,
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.body["tokens_valid_since"].is_string());

    for pair in [&a, &b] {
        assert_eq!(
            app.get("/auth/me", Some(&pair.access_token)).await.status,
            StatusCode::UNAUTHORIZED
        );
    }
    assert_eq!(
        app.get("/auth/me", Some(&admin.access_token)).await.status,
        StatusCode::OK
    );

    let fresh = login(&app, MEMBER_EMAIL, PASSWORD).await;
    assert_eq!(
        app.get("/auth/me", Some(&fresh.access_token)).await.status,
        StatusCode::OK
    );
}

#[tokio::test]
async fn password_change_revokes_everything_and_returns_a_new_pair() {
    let app = TestApp::spawn().await;
    let old = login(&app, MEMBER_EMAIL, PASSWORD).await;
    let other_device = app.tokens_for(MEMBER_ID).await;

    let res = app
        .post(
            "/auth/password",
            Some(&old.access_token),
            json!({
                "current_password": PASSWORD,
                "new_password": "a much better passphrase"
            }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let fresh: TokenPair = serde_json::from_value(res.body).unwrap();

    for pair in [&old, &other_device] {
        assert_eq!(
            app.get("/auth/me", Some(&pair.access_token)).await.status,
            StatusCode::UNAUTHORIZED
        );
    }
    assert_eq!(
        app.get("/auth/me", Some(&fresh.access_token)).await.status,
        StatusCode::OK
    );

    let old_password = app
        .post(
            "/auth/login",
            None,
            json!({ "email": MEMBER_EMAIL, "password": PASSWORD }),
        )
        .await;
    assert_eq!(old_password.status, StatusCode::UNAUTHORIZED);
    login(&app, MEMBER_EMAIL, "a much better passphrase").await;

    assert!(app
        .audit_types()
        .await
        .contains(&"password_changed".to_string()));
}

#[tokio::test]
async fn password_change_checks_current_password_and_account_kind() {
    let app = TestApp::spawn().await;
    let member = app.tokens_for(MEMBER_ID).await;
    let oauth = app.tokens_for(OAUTH_USER_ID).await;

    let wrong = app
        .post(
            "/auth/password",
            Some(&member.access_token),
            json!({ "current_password": "guess", "new_password": "long enough now" }),
        )
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        app.get("/auth/me", Some(&member.access_token)).await.status,
        StatusCode::OK
    );

    let too_short = app
        .post(
            "/auth/password",
            Some(&member.access_token),
            json!({ "current_password": PASSWORD, "new_password": "short" }),
        )
        .await;
    assert_eq!(too_short.status, StatusCode::BAD_REQUEST);

    let not_password_account = app
        .post(
            "/auth/password",
            Some(&oauth.access_token),
            json!({ "current_password": PASSWORD, "new_password": "long enough now" }),
        )
        .await;
    assert_eq!(not_password_account.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn introspection_reports_current_state() {
    let app = TestApp::spawn().await;
    let pair = app.tokens_for(MEMBER_ID).await;

    let active = app
        .post(
            "/auth/introspect",
            None,
            json!({ "token": pair.refresh_token }),
        )
        .await;
    assert_eq!(active.status, StatusCode::OK);
    assert_eq!(active.body["active"], true);
    assert_eq!(active.body["sub"], MEMBER_ID);
    assert_eq!(active.body["token_type"], "refresh");

    app.send(
        axum::http::Method::POST,
        "/auth/logout",
        Some(&pair.access_token),
        None,
    )
    .await;

    let inactive = app
        .post(
            "/auth/introspect",
            None,
            json!({ "token": pair.access_token }),
        )
        .await;
    assert_eq!(inactive.status, StatusCode::OK);
    assert_eq!(inactive.body, json!({ "active": false }));
}

#[tokio::test]
async fn validation_fails_closed_when_the_store_is_down() {
    let inner = Arc::new(InMemoryTokenStore::new());
    let faulty = Arc::new(FaultyStore::new(inner.clone()));
    let app = TestApp::with_store(faulty.clone(), inner).await;
    let pair = app.tokens_for(MEMBER_ID).await;

    faulty.go_down();
    let res = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let refresh = app
        .post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": pair.refresh_token }),
        )
        .await;
    assert_eq!(refresh.status, StatusCode::UNAUTHORIZED);

    let health = app.get("/health", None).await;
    assert_eq!(health.status, StatusCode::SERVICE_UNAVAILABLE);

    faulty.recover();
    let res = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(res.status, StatusCode::OK);
}

#[tokio::test]
async fn validation_fails_closed_when_the_store_stalls() {
    let inner = Arc::new(InMemoryTokenStore::new());
    let faulty = Arc::new(FaultyStore::new(inner.clone()));
    let app = TestApp::with_store(faulty.clone(), inner).await;
    let pair = app.tokens_for(MEMBER_ID).await;

    faulty.stall();
    let started = Instant::now();
    let res = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn health_and_metrics_are_public() {
    let app = TestApp::spawn().await;
    app.tokens_for(MEMBER_ID).await;

    let health = app.get("/health", None).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["status"], "healthy");

    let metrics = app.get("/metrics", None).await;
    assert_eq!(metrics.status, StatusCode::OK);
    let text = metrics.body.as_str().unwrap();
    assert!(text.contains("token_service_tokens_issued_total"));
}
