//! Error types for chatter-cache
//!
//! `CacheError` is what callers of the cache and the CLI see. The storage and
//! lookup layers have their own error enums (`StoreError`, `LookupError`) which
//! are folded into it at the cache boundary.

use crate::lookup::LookupError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for chatter-cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum CacheError {
    /// The key handed to `resolve` cannot identify anyone
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Persistent storage could not be read or written
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    /// Storage had no record and the external lookup did not produce one
    #[error("Lookup failed for '{key}': {source}")]
    LookupFailed {
        key: String,
        #[source]
        source: LookupError,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client construction errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl CacheError {
    /// True when the failure came from the external lookup rather than local state
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, CacheError::LookupFailed { .. })
    }

    /// True when the external lookup reported that the key does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::LookupFailed {
                source: LookupError::NotFound(_),
                ..
            }
        )
    }
}
