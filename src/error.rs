// src/error.rs

//! Crate-wide error type for the copy engine.

use thiserror::Error;

/// Errors raised by the copy engine and the reference store adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration tree or its inputs are structurally invalid.
    /// Fatal: the request is rejected before any resolution or write.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The engine hit an inconsistency while resolving references,
    /// e.g. an id-map lookup for a record that was never copied.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A store adapter failure that is not database-specific.
    /// Custom `Store` implementations report through this variant.
    #[error("store error: {0}")]
    Store(String),

    /// SQLite failure from the reference store adapter.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to serialize a result or diagnostic map.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for errors raised by config validation, which hosting layers
    /// may map onto a serializable `Outcome::ValidationError`.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

/// Result type for copy engine operations.
pub type Result<T> = std::result::Result<T, Error>;
