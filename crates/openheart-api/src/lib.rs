//! OpenHeart API library
//!
//! The router, handlers and session auth behind the `openheart-api` binary, exposed as a
//! library so integration tests can build the same app over in-memory collaborators.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod setup;
pub mod state;

pub use error::{HttpAppError, ValidatedJson};
pub use state::AppState;
