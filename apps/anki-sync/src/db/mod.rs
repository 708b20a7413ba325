//! Persisted sync state in a local SQLite database.

pub mod error;
pub mod repository;
pub mod schema;

pub use error::DbError;
pub use repository::{SqliteStateStore, StateRepository, StateSnapshot};
