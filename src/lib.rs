//! chatter-cache - profile lookaside cache for chat overlays
//!
//! Resolves a chat username to a display name and avatar URL. Records are
//! read from a local SQLite table first; misses are filled from the Twitch
//! Helix users API and written back, so each chatter costs at most one API
//! call for the lifetime of the database.
//!
//! # Architecture
//!
//! - **cache**: `LookasideCache`, the read-through/fill protocol with in-flight de-duplication
//! - **store**: `PersistentStore` trait with SQLite and in-memory backends
//! - **lookup**: `ExternalLookup` trait and the Twitch Helix client
//! - **retry**: Exponential backoff for the external lookup
//! - **config**: YAML configuration
//! - **metrics**: Prometheus counters and lookup latency

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod lookup;
pub mod metrics;
pub mod profile;
pub mod retry;
pub mod store;

// Re-exports
pub use cache::{CacheStats, LookasideCache, WriteOutcome, WriteReport};
pub use error::{CacheError, Result};
pub use profile::ProfileRecord;
