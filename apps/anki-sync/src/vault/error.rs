//! Error types for the host document store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ignore pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("Document not found: {0}")]
    NotFound(String),
}

impl HostError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
