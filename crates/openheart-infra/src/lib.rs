//! OpenHeart Infrastructure Library
//!
//! Shared infrastructure for the HTTP service:
//! - Middleware (request ID, security headers)
//! - Tracing subscriber initialisation
//! - The JSON error body every failed request returns

#[cfg(feature = "middleware")]
pub mod middleware;

pub mod error;
pub mod telemetry;

#[cfg(feature = "middleware")]
pub use middleware::{
    get_request_id, request_id_middleware, security_headers_middleware, RequestId,
};

pub use error::ErrorResponse;
pub use telemetry::{init_telemetry, LogFormat};
