//! OpenHeart Database Layer
//!
//! SQLite-backed repositories for users and file records. Every query is scoped to the
//! acting user; no repository method touches another user's rows.

pub mod file;
pub mod pool;
pub mod user;

pub use file::{FileFilter, FileRepository};
pub use pool::{connect, connect_in_memory, ping, run_migrations};
pub use user::UserRepository;

pub use sqlx::SqlitePool;
