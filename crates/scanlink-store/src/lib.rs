pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionRecord, SessionStore, SqliteSessionStore, DEFAULT_SESSION_TTL};
