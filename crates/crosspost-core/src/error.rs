//! Error types for core operations.

use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A website id appears more than once in the registry.
    #[error("duplicate website in registry: {0}")]
    DuplicateWebsite(String),

    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed.
    #[error("failed to parse {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Submission store operation failed.
    #[error("submission store error: {0}")]
    Store(String),
}
