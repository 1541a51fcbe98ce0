//! HTTP error response body.
//!
//! The `IntoResponse` implementation for `AppError` lives in the API crate; the orphan
//! rule keeps it out of library crates that own neither the trait nor the type.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Machine-readable code, e.g. `REMOTE_NOT_FOUND`.
    pub code: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorResponse {
    /// Non-recoverable error without details.
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            error_type: None,
            code: code.into(),
            recoverable: false,
            suggested_action: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_are_omitted() {
        let body = serde_json::to_value(ErrorResponse::new("Missing session", "UNAUTHORIZED"))
            .unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert_eq!(body["recoverable"], false);
        assert!(body.get("details").is_none());
        assert!(body.get("suggested_action").is_none());
    }
}
