//! Registration, token login and logout.

use crate::auth::token::{generate_login_token, hash_login_token, verify_login_token};
use crate::auth::SessionUser;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use openheart_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Lowercased, trimmed address with a local part and a dotted domain.
fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        }
        None => false,
    };
    if !valid || email.chars().any(char::is_whitespace) {
        return Err(AppError::InvalidInput(format!(
            "Invalid email address: {}",
            raw.trim()
        )));
    }
    Ok(email)
}

#[tracing::instrument(skip(state, request))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let email = normalize_email(&request.email)?;
    let (user, created) = state.users.get_or_create(&email).await?;
    let status = if created {
        tracing::info!(user_id = %user.id, "User registered");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(UserResponse {
            id: user.id,
            email: user.email,
        }),
    ))
}

/// Issue a fresh single-use token; any earlier token stops working.
#[tracing::instrument(skip(state, request))]
pub async fn request_token(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let email = normalize_email(&request.email)?;
    let user = state
        .users
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No registered user {}", email)))?;

    let token = generate_login_token();
    let hash = hash_login_token(&token)?;
    state.users.set_token_hash(user.id, Some(&hash)).await?;
    state.token_sender.send_token(&user.email, &token).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("Login token sent to {}", user.email),
        }),
    ))
}

#[tracing::instrument(skip(state, request))]
pub async fn login(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let invalid = || AppError::Unauthorized("Invalid email or token".to_string());

    let email = normalize_email(&request.email).map_err(|_| invalid())?;
    let user = state.users.find_by_email(&email).await?.ok_or_else(invalid)?;
    let hash = user.token_hash.as_deref().ok_or_else(invalid)?;
    if !verify_login_token(request.token.trim(), hash)? {
        tracing::debug!(user_id = %user.id, "Login token mismatch");
        return Err(invalid().into());
    }

    // single use
    state.users.set_token_hash(user.id, None).await?;
    let access_token = state.sessions.issue(user.id)?;
    tracing::info!(user_id = %user.id, "User logged in");

    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.sessions.expiry_seconds(),
    }))
}

/// Purge the caller's working set and remove the user.
#[tracing::instrument(skip(state), fields(user_id = %session.user_id))]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<impl IntoResponse, HttpAppError> {
    state.lifecycle.logout(session.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
