//! Lookaside cache for chat user profiles
//!
//! Reads through a [`crate::store::PersistentStore`] and fills misses from an
//! [`crate::lookup::ExternalLookup`], persisting new records in the background.

mod lookaside;
mod stats;
mod write_behind;

pub use lookaside::LookasideCache;
pub use stats::CacheStats;
pub use write_behind::{WriteOutcome, WriteReport};
