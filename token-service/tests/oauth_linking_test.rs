mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{
    callback_session, default_providers, error_redirect, state_param, TestApp, OAUTH_USER_ID,
};
use serde_json::json;
use std::collections::HashMap;
use token_service::models::{Invitation, ProviderKind, Role};
use token_service::services::{OAuthProvider, TokenPair, UserDirectory};

/// Starts a sign-in and returns the state the provider would echo back.
async fn begin(app: &TestApp, provider: &str, query: &str) -> String {
    let res = app.get(&format!("/auth/{}{}", provider, query), None).await;
    assert_eq!(res.status, StatusCode::FOUND);
    state_param(res.location.as_deref().unwrap())
}

async fn callback(app: &TestApp, provider: &str, query: &str) -> String {
    let res = app
        .get(&format!("/auth/{}/callback?{}", provider, query), None)
        .await;
    assert_eq!(res.status, StatusCode::FOUND);
    res.location.unwrap()
}

async fn sign_in(app: &TestApp, provider: &str, code: &str) -> String {
    let state = begin(app, provider, "").await;
    callback(app, provider, &format!("code={}&state={}", code, state)).await
}

#[tokio::test]
async fn initiate_redirects_with_state_and_pkce_challenge() {
    let app = TestApp::spawn().await;

    let res = app.get("/auth/google", None).await;
    assert_eq!(res.status, StatusCode::FOUND);
    let location = res.location.unwrap();
    assert!(location.starts_with("https://google.provider.test/authorize?"));

    let challenge = location
        .split('&')
        .find_map(|p| p.strip_prefix("code_challenge="))
        .unwrap();
    assert_eq!(challenge.len(), 43);
    assert_eq!(state_param(&location).len(), 43);

    let other = app.get("/auth/google", None).await.location.unwrap();
    assert_ne!(state_param(&location), state_param(&other));
}

#[tokio::test]
async fn unknown_or_unconfigured_provider_is_not_found() {
    let mut providers: HashMap<ProviderKind, std::sync::Arc<dyn OAuthProvider>> =
        default_providers();
    providers.remove(&ProviderKind::Github);
    let app = TestApp::with_providers(providers).await;

    assert_eq!(app.get("/auth/facebook", None).await.status, StatusCode::NOT_FOUND);
    assert_eq!(app.get("/auth/github", None).await.status, StatusCode::NOT_FOUND);
    assert_eq!(
        app.get("/auth/github/callback?code=x&state=y", None)
            .await
            .status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn overlong_invitation_token_is_rejected() {
    let app = TestApp::spawn().await;
    let res = app
        .get(
            &format!("/auth/google?invitation_token={}", "t".repeat(300)),
            None,
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn existing_oauth_account_signs_in_through_a_one_time_grant() {
    let app = TestApp::spawn().await;

    let location = sign_in(&app, "google", "bob-code").await;
    let (grant, kind) = callback_session(&location);
    assert_eq!(kind, "login");
    assert!(!location.contains("access_token"));

    let res = app
        .post("/auth/oauth/exchange", None, json!({ "session_id": grant }))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let pair: TokenPair = serde_json::from_value(res.body).unwrap();

    let me = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["user_id"], OAUTH_USER_ID);

    let replay = app
        .post("/auth/oauth/exchange", None, json!({ "session_id": grant }))
        .await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.body["error"], "Invalid or expired session");

    assert!(app.audit_types().await.contains(&"oauth_login".to_string()));
}

#[tokio::test]
async fn password_account_is_told_to_use_its_password() {
    let app = TestApp::spawn().await;
    let location = sign_in(&app, "google", "alice-code").await;
    assert_eq!(location, error_redirect("account_exists_use_password"));
}

#[tokio::test]
async fn other_provider_is_pointed_at_the_linked_one() {
    let app = TestApp::spawn().await;
    let location = sign_in(&app, "github", "bob-gh").await;
    assert_eq!(location, error_redirect("use_google"));
}

#[tokio::test]
async fn different_subject_with_same_email_is_refused_and_audited() {
    let app = TestApp::spawn().await;
    let location = sign_in(&app, "google", "bob-imposter").await;

    assert_eq!(location, error_redirect("authentication_failed"));
    assert!(app
        .audit_types()
        .await
        .contains(&"oauth_identity_mismatch".to_string()));
    assert!(!app.audit_types().await.contains(&"oauth_login".to_string()));
}

#[tokio::test]
async fn unverified_provider_email_is_refused() {
    let app = TestApp::spawn().await;
    let location = sign_in(&app, "google", "unverified").await;
    assert_eq!(location, error_redirect("authentication_failed"));
}

#[tokio::test]
async fn account_gates_apply_before_email_verification() {
    let app = TestApp::spawn().await;

    let password_account = sign_in(&app, "google", "alice-unverified").await;
    assert_eq!(password_account, error_redirect("account_exists_use_password"));

    let other_provider = sign_in(&app, "github", "bob-gh-unverified").await;
    assert_eq!(other_provider, error_redirect("use_google"));

    // All gates pass, so the unverified email is what refuses the login.
    let linked = sign_in(&app, "google", "bob-unverified").await;
    assert_eq!(linked, error_redirect("authentication_failed"));
    assert!(!app.audit_types().await.contains(&"oauth_login".to_string()));
}

#[tokio::test]
async fn malformed_callbacks_end_on_the_error_page() {
    let app = TestApp::spawn().await;

    let state = begin(&app, "google", "").await;
    let denied = callback(&app, "google", &format!("error=access_denied&state={}", state)).await;
    assert_eq!(denied, error_redirect("oauth_failed"));

    let no_code = callback(&app, "google", "state=whatever").await;
    assert_eq!(no_code, error_redirect("oauth_failed"));

    let no_state = callback(&app, "google", "code=bob-code").await;
    assert_eq!(no_state, error_redirect("invalid_state"));

    let forged = callback(&app, "google", "code=bob-code&state=forged").await;
    assert_eq!(forged, error_redirect("invalid_state"));

    let state = begin(&app, "google", "").await;
    let bad_code = callback(&app, "google", &format!("code=nope&state={}", state)).await;
    assert_eq!(bad_code, error_redirect("token_exchange_failed"));
}

#[tokio::test]
async fn state_is_single_use_and_bound_to_its_provider() {
    let app = TestApp::spawn().await;

    let state = begin(&app, "google", "").await;
    let query = format!("code=bob-code&state={}", state);
    let first = callback(&app, "google", &query).await;
    assert_eq!(callback_session(&first).1, "login");
    let replay = callback(&app, "google", &query).await;
    assert_eq!(replay, error_redirect("invalid_state"));

    let github_state = begin(&app, "github", "").await;
    let crossed = callback(
        &app,
        "google",
        &format!("code=bob-code&state={}", github_state),
    )
    .await;
    assert_eq!(crossed, error_redirect("invalid_state"));
}

#[tokio::test]
async fn concurrent_callbacks_with_one_state_succeed_once() {
    let app = TestApp::spawn().await;
    let state = begin(&app, "google", "").await;
    let query = format!("code=bob-code&state={}", state);

    let (a, b) = tokio::join!(
        callback(&app, "google", &query),
        callback(&app, "google", &query),
    );

    let logins = [&a, &b]
        .iter()
        .filter(|l| l.contains("type=login"))
        .count();
    assert_eq!(logins, 1);
    assert!(a == error_redirect("invalid_state") || b == error_redirect("invalid_state"));
}

#[tokio::test]
async fn new_identity_goes_through_signup() {
    let app = TestApp::spawn().await;

    let location = sign_in(&app, "google", "new-code").await;
    let (session, kind) = callback_session(&location);
    assert_eq!(kind, "signup");

    let res = app
        .post(
            "/auth/oauth/signup",
            None,
            json!({ "session_id": session, "first_name": "  Carol ", "last_name": "" }),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED);
    let pair: TokenPair = serde_json::from_value(res.body).unwrap();

    let me = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["role"], "member");

    let account = app
        .users
        .get_user_by_email("carol@example.test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.first_name, "Carol");
    assert_eq!(account.last_name, "User");
    assert_eq!(account.oauth_provider.as_deref(), Some("google"));
    assert_eq!(account.oauth_provider_id.as_deref(), Some("google-sub-new"));

    let again = app
        .post("/auth/oauth/signup", None, json!({ "session_id": session }))
        .await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);

    // The new account now signs in directly.
    let location = sign_in(&app, "google", "new-code").await;
    assert_eq!(callback_session(&location).1, "login");
}

#[tokio::test]
async fn invitation_sets_the_role_and_is_consumed() {
    let app = TestApp::spawn().await;
    app.users.insert_invitation(Invitation {
        token: "invite-1".to_string(),
        email: Some("dave@example.test".to_string()),
        role: Role::Admin,
        expires_at: Utc::now() + Duration::days(1),
        consumed_at: None,
    });

    let state = begin(&app, "github", "?invitation_token=invite-1").await;
    let location = callback(&app, "github", &format!("code=dave-gh&state={}", state)).await;
    let (session, _) = callback_session(&location);

    let res = app
        .post("/auth/oauth/signup", None, json!({ "session_id": session }))
        .await;
    assert_eq!(res.status, StatusCode::CREATED);
    let pair: TokenPair = serde_json::from_value(res.body).unwrap();

    let me = app.get("/auth/me", Some(&pair.access_token)).await;
    assert_eq!(me.body["role"], "admin");
    assert!(app.users.invitation("invite-1").unwrap().consumed_at.is_some());
}

#[tokio::test]
async fn expired_invitation_is_gone() {
    let app = TestApp::spawn().await;
    app.users.insert_invitation(Invitation {
        token: "stale".to_string(),
        email: None,
        role: Role::Member,
        expires_at: Utc::now() - Duration::minutes(1),
        consumed_at: None,
    });

    let state = begin(&app, "google", "?invitation_token=stale").await;
    let location = callback(&app, "google", &format!("code=new-code&state={}", state)).await;
    let (session, _) = callback_session(&location);

    let res = app
        .post("/auth/oauth/signup", None, json!({ "session_id": session }))
        .await;
    assert_eq!(res.status, StatusCode::GONE);

    assert!(app
        .users
        .get_user_by_email("carol@example.test")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn second_signup_for_the_same_email_conflicts() {
    let app = TestApp::spawn().await;

    let (first, _) = callback_session(&sign_in(&app, "google", "new-code").await);
    let (second, _) = callback_session(&sign_in(&app, "google", "new-code").await);

    let created = app
        .post("/auth/oauth/signup", None, json!({ "session_id": first }))
        .await;
    assert_eq!(created.status, StatusCode::CREATED);

    let conflict = app
        .post("/auth/oauth/signup", None, json!({ "session_id": second }))
        .await;
    assert_eq!(conflict.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn exchange_rejects_unknown_ids() {
    let app = TestApp::spawn().await;

    let unknown = app
        .post("/auth/oauth/exchange", None, json!({ "session_id": "nope" }))
        .await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

    let empty = app
        .post("/auth/oauth/exchange", None, json!({ "session_id": "" }))
        .await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
}
