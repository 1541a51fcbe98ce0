use async_trait::async_trait;
use axum_test::TestServer;
use openheart_api::mailer::TokenSender;
use openheart_core::AppResult;
use std::collections::HashMap;
use std::sync::Mutex;

/// Keeps the last token issued per address so tests can log in.
#[derive(Debug, Default)]
pub struct RecordingTokenSender {
    sent: Mutex<HashMap<String, String>>,
}

impl RecordingTokenSender {
    pub fn last_token(&self, email: &str) -> Option<String> {
        self.sent.lock().unwrap().get(email).cloned()
    }
}

#[async_trait]
impl TokenSender for RecordingTokenSender {
    async fn send_token(&self, email: &str, token: &str) -> AppResult<()> {
        self.sent
            .lock()
            .unwrap()
            .insert(email.to_string(), token.to_string());
        Ok(())
    }
}

pub struct TestUser {
    pub email: String,
    pub token: String,
}

impl TestUser {
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Register `email`, request a login token and exchange it for a session.
pub async fn login_test_user(
    client: &TestServer,
    tokens: &RecordingTokenSender,
    email: &str,
) -> TestUser {
    let response = client
        .post("/auth/register")
        .json(&serde_json::json!({ "email": email }))
        .await;
    assert!(response.status_code() == 200 || response.status_code() == 201);

    let response = client
        .post("/auth/token")
        .json(&serde_json::json!({ "email": email }))
        .await;
    assert_eq!(response.status_code(), 202);
    let login_token = tokens.last_token(email).expect("Expected a token to be sent");

    let response = client
        .post("/auth/login")
        .json(&serde_json::json!({ "email": email, "token": login_token }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    let token = body["access_token"]
        .as_str()
        .expect("Expected 'access_token' in login response")
        .to_string();

    TestUser {
        email: email.to_string(),
        token,
    }
}
