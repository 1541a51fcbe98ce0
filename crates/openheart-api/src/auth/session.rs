//! HS256 session tokens.

use super::models::Claims;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use openheart_core::{AppError, AppResult};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionKeys {
    encoding: Arc<EncodingKey>,
    decoding: Arc<DecodingKey>,
    expiry: Duration,
}

impl SessionKeys {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            expiry: Duration::hours(expiry_hours),
        }
    }

    pub fn expiry_seconds(&self) -> i64 {
        self.expiry.num_seconds()
    }

    pub fn issue(&self, user_id: Uuid) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            iat: now.timestamp(),
            exp: (now + self.expiry).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Failed to sign session token: {}", e)))
    }

    pub fn validate(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        let token_data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!("JWT validation failed: {}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AppError::Unauthorized("Session has expired".to_string())
                }
                _ => AppError::Unauthorized("Invalid session token".to_string()),
            }
        })?;
        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-min-32-characters-long";

    #[test]
    fn test_issue_and_validate() {
        let keys = SessionKeys::new(SECRET, 1);
        let user_id = Uuid::new_v4();
        let token = keys.issue(user_id).unwrap();
        let claims = keys.validate(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let keys = SessionKeys::new(SECRET, -1);
        let token = keys.issue(Uuid::new_v4()).unwrap();
        let err = keys.validate(&token).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(msg) if msg.contains("expired")));
    }

    #[test]
    fn test_foreign_signature_is_rejected() {
        let token = SessionKeys::new("another-secret-key-of-at-least-32-chars", 1)
            .issue(Uuid::new_v4())
            .unwrap();
        let err = SessionKeys::new(SECRET, 1).validate(&token).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
