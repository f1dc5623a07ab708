//! Persistent storage for profile records
//!
//! Defines the trait the cache reads through, plus two backends:
//! - [`SqliteStore`]: the on-disk single-table store used in production
//! - [`MemoryStore`]: a process-local map, handy for tests and dry runs
//!
//! Inserts are first-write-wins: inserting a key that already exists is not an
//! error and leaves the stored record untouched.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, StoredProfile};

use crate::profile::ProfileRecord;
use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend could not be reached at all (poisoned lock, failed worker task, ...)
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Trait for profile storage backends
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Fetch the record stored for `key`, if any
    async fn find_by_key(&self, key: &str) -> Result<Option<ProfileRecord>>;

    /// Store a record unless one already exists for its key
    async fn insert(&self, record: &ProfileRecord) -> Result<()>;
}
