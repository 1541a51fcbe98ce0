use super::models::SessionUser;
use super::session::SessionKeys;
use crate::error::HttpAppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use openheart_core::AppError;
use openheart_db::UserRepository;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthState {
    pub keys: SessionKeys,
    pub users: UserRepository,
}

/// Require `Authorization: Bearer <jwt>` naming a user that still exists.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(auth_header) = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
    else {
        return unauthorized("Missing authorization header");
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return unauthorized("Invalid authorization header format");
    };

    let claims = match auth_state.keys.validate(token.trim()) {
        Ok(claims) => claims,
        Err(e) => return HttpAppError(e).into_response(),
    };

    match auth_state.users.get_by_id(claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return unauthorized("Session user no longer exists"),
        Err(e) => return HttpAppError(e).into_response(),
    }

    tracing::debug!(user_id = %claims.sub, "Session authenticated");
    request.extensions_mut().insert(SessionUser {
        user_id: claims.sub,
    });
    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    HttpAppError(AppError::Unauthorized(message.to_string())).into_response()
}
