//! Errors that end a run before any remote mutation.

use thiserror::Error;

use crate::anki::RemoteError;
use crate::db::DbError;
use crate::vault::HostError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("AnkiConnect is not reachable: {0}")]
    Connectivity(String),

    #[error("Sync already in progress")]
    AlreadyInProgress,

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Document store error: {0}")]
    Host(#[from] HostError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_connectivity() {
            Self::Connectivity(err.to_string())
        } else {
            Self::Remote(err)
        }
    }
}
