//! Session plumbing: single-use login tokens, HS256 session JWTs and the bearer middleware.

pub mod middleware;
pub mod models;
pub mod session;
pub mod token;

pub use middleware::{auth_middleware, AuthState};
pub use models::{Claims, SessionUser};
pub use session::SessionKeys;
