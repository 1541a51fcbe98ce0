//! Login tokens: five random digits, stored only as an argon2 hash.

use openheart_core::{AppError, AppResult};
use rand::Rng;

pub const LOGIN_TOKEN_DIGITS: usize = 5;

/// Fresh zero-padded numeric token, e.g. `04217`.
pub fn generate_login_token() -> String {
    let upper = 10u32.pow(LOGIN_TOKEN_DIGITS as u32);
    let value = rand::rng().random_range(0..upper);
    format!("{:0width$}", value, width = LOGIN_TOKEN_DIGITS)
}

pub fn hash_login_token(token: &str) -> AppResult<String> {
    use argon2::{
        password_hash::{PasswordHasher, SaltString},
        Argon2,
    };
    use rand_core::OsRng;

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash login token: {}", e)))
}

pub fn verify_login_token(token: &str, hash: &str) -> AppResult<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };

    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid hash format: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(token.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_login_token() {
        for _ in 0..50 {
            let token = generate_login_token();
            assert_eq!(token.len(), LOGIN_TOKEN_DIGITS);
            assert!(token.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_hash_and_verify_login_token() {
        let token = generate_login_token();
        let hash = hash_login_token(&token).unwrap();

        assert_ne!(hash, token);
        assert!(verify_login_token(&token, &hash).unwrap());
        assert!(!verify_login_token("not-it", &hash).unwrap());
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(verify_login_token("12345", "plain-text").is_err());
    }
}
