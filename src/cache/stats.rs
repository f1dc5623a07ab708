//! Per-cache counters

use crate::metrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the cache and its background tasks
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    lookups: AtomicU64,
    lookup_failures: AtomicU64,
    coalesced: AtomicU64,
    storage_read_errors: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

macro_rules! counter {
    ($method:ident, $field:ident, $op:literal) => {
        pub(crate) fn $method(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_op($op);
        }
    };
}

impl StatsCounters {
    counter!(hit, hits, "hit");
    counter!(miss, misses, "miss");
    counter!(lookup, lookups, "lookup");
    counter!(lookup_failure, lookup_failures, "lookup_failure");
    counter!(coalesce, coalesced, "coalesced");
    counter!(write, writes, "write");

    pub(crate) fn storage_read_error(&self) {
        self.storage_read_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_storage_error("read");
    }

    pub(crate) fn write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_storage_error("write");
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            storage_read_errors: self.storage_read_errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a cache's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Served straight from storage
    pub hits: u64,
    /// Storage had nothing (or failed) and a fill was needed
    pub misses: u64,
    /// External lookups actually issued
    pub lookups: u64,
    pub lookup_failures: u64,
    /// Misses that joined a lookup already in flight
    pub coalesced: u64,
    pub storage_read_errors: u64,
    /// Background inserts that succeeded
    pub writes: u64,
    pub write_failures: u64,
}
