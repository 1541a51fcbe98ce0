//! Application state shared by every handler.

use crate::auth::{AuthState, SessionKeys};
use crate::mailer::TokenSender;
use openheart_db::{SqlitePool, UserRepository};
use openheart_services::UploadLifecycle;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub users: UserRepository,
    pub lifecycle: UploadLifecycle,
    pub sessions: SessionKeys,
    pub token_sender: Arc<dyn TokenSender>,
}

impl AppState {
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            keys: self.sessions.clone(),
            users: self.users.clone(),
        }
    }
}
