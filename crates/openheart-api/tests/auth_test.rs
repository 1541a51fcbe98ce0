//! Session API integration tests.
//!
//! Run with: `cargo test -p openheart-api --test auth_test`

mod helpers;

use helpers::auth::login_test_user;
use helpers::setup_test_app;

#[tokio::test]
async fn test_health() {
    let app = setup_test_app().await;
    let response = app.client().get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["database"], "healthy");
    assert!(response.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let app = setup_test_app().await;
    let client = app.client();

    let first = client
        .post("/auth/register")
        .json(&serde_json::json!({ "email": "Researcher@Example.com" }))
        .await;
    assert_eq!(first.status_code(), 201);
    let second = client
        .post("/auth/register")
        .json(&serde_json::json!({ "email": "researcher@example.com" }))
        .await;
    assert_eq!(second.status_code(), 200);

    let a: serde_json::Value = first.json();
    let b: serde_json::Value = second.json();
    assert_eq!(a["id"], b["id"]);
    assert_eq!(b["email"], "researcher@example.com");
}

#[tokio::test]
async fn test_register_rejects_invalid_email() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .post("/auth/register")
        .json(&serde_json::json!({ "email": "not-an-address" }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_malformed_body_uses_error_shape() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .post("/auth/register")
        .json(&serde_json::json!({ "mail": "a@example.com" }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_token_for_unknown_user_is_not_found() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .post("/auth/token")
        .json(&serde_json::json!({ "email": "nobody@example.com" }))
        .await;
    assert_eq!(response.status_code(), 404);
    assert!(app.tokens.last_token("nobody@example.com").is_none());
}

#[tokio::test]
async fn test_login_token_is_single_use() {
    let app = setup_test_app().await;
    let client = app.client();
    let email = "researcher@example.com";
    login_test_user(client, &app.tokens, email).await;

    let used = app.tokens.last_token(email).unwrap();
    let response = client
        .post("/auth/login")
        .json(&serde_json::json!({ "email": email, "token": used }))
        .await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn test_new_token_invalidates_previous() {
    let app = setup_test_app().await;
    let client = app.client();
    let email = "researcher@example.com";
    client
        .post("/auth/register")
        .json(&serde_json::json!({ "email": email }))
        .await;

    client
        .post("/auth/token")
        .json(&serde_json::json!({ "email": email }))
        .await;
    let first = app.tokens.last_token(email).unwrap();
    // the recorder keeps the latest token only
    let mut second = first.clone();
    while second == first {
        client
            .post("/auth/token")
            .json(&serde_json::json!({ "email": email }))
            .await;
        second = app.tokens.last_token(email).unwrap();
    }

    let stale = client
        .post("/auth/login")
        .json(&serde_json::json!({ "email": email, "token": first }))
        .await;
    assert_eq!(stale.status_code(), 401);

    let fresh = client
        .post("/auth/login")
        .json(&serde_json::json!({ "email": email, "token": second }))
        .await;
    assert_eq!(fresh.status_code(), 200);
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let app = setup_test_app().await;
    let client = app.client();
    let email = "researcher@example.com";
    client
        .post("/auth/register")
        .json(&serde_json::json!({ "email": email }))
        .await;
    client
        .post("/auth/token")
        .json(&serde_json::json!({ "email": email }))
        .await;
    let issued = app.tokens.last_token(email).unwrap();
    let wrong = if issued == "00000" { "00001" } else { "00000" };

    let response = client
        .post("/auth/login")
        .json(&serde_json::json!({ "email": email, "token": wrong }))
        .await;
    assert_eq!(response.status_code(), 401);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_protected_routes_require_session() {
    let app = setup_test_app().await;
    let client = app.client();

    let missing = client.get("/uploads/review").await;
    assert_eq!(missing.status_code(), 401);

    let malformed = client
        .get("/uploads/review")
        .add_header("Authorization", "Token abc")
        .await;
    assert_eq!(malformed.status_code(), 401);

    let forged = client
        .get("/uploads/review")
        .add_header("Authorization", "Bearer not.a.jwt")
        .await;
    assert_eq!(forged.status_code(), 401);
}

#[tokio::test]
async fn test_logout_removes_user_and_session() {
    let app = setup_test_app().await;
    let client = app.client();
    let user = login_test_user(client, &app.tokens, "researcher@example.com").await;

    let response = client
        .post("/auth/logout")
        .add_header("Authorization", user.bearer())
        .await;
    assert_eq!(response.status_code(), 204);
    assert!(app
        .users()
        .find_by_email(&user.email)
        .await
        .unwrap()
        .is_none());

    // the JWT is still well-formed but its user is gone
    let response = client
        .get("/uploads/review")
        .add_header("Authorization", user.bearer())
        .await;
    assert_eq!(response.status_code(), 401);
}
