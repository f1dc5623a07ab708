//! Read-through lookaside cache

use super::stats::{CacheStats, StatsCounters};
use super::write_behind::{WriteBehind, WriteReport};
use crate::config::{ChatterCacheConfig, StorageErrorPolicy};
use crate::lookup::{ExternalLookup, LookupError, TwitchLookup};
use crate::metrics;
use crate::profile::ProfileRecord;
use crate::retry::RetryPolicy;
use crate::store::{PersistentStore, SqliteStore};
use crate::{CacheError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, warn};

type Flight = Shared<BoxFuture<'static, std::result::Result<ProfileRecord, LookupError>>>;
type FlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

struct InFlight {
    id: u64,
    flight: Flight,
}

/// Clears a flight's map entry when the lookup task ends, unless a newer
/// lookup already replaced it. Runs on panic too.
struct FlightGuard {
    flights: FlightMap,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(&self.key).is_some_and(|f| f.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Maps an identity key to its profile, reading storage first and filling
/// from the external lookup on a miss.
///
/// Cheap to share behind an `Arc`; `resolve` takes `&self`. At most one
/// external lookup per key is in flight at a time: concurrent misses for the
/// same key wait on the same lookup.
pub struct LookasideCache {
    store: Arc<dyn PersistentStore>,
    lookup: Arc<dyn ExternalLookup>,
    policy: StorageErrorPolicy,
    in_flight: FlightMap,
    next_flight_id: AtomicU64,
    writer: Arc<WriteBehind>,
    stats: Arc<StatsCounters>,
}

impl LookasideCache {
    /// Cache over `store`, filling misses from `lookup`, with the advisory
    /// storage error policy.
    pub fn new(store: Arc<dyn PersistentStore>, lookup: Arc<dyn ExternalLookup>) -> Self {
        let stats = Arc::new(StatsCounters::default());
        let writer = Arc::new(WriteBehind::new(Arc::clone(&store), Arc::clone(&stats)));

        Self {
            store,
            lookup,
            policy: StorageErrorPolicy::default(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_flight_id: AtomicU64::new(0),
            writer,
            stats,
        }
    }

    /// Use `policy` for storage read errors
    pub fn with_policy(mut self, policy: StorageErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// SQLite storage and Twitch lookup wired from a config file.
    ///
    /// Returns the store as well so callers can run administrative queries
    /// against the same database.
    pub fn from_config(config: &ChatterCacheConfig) -> Result<(Self, SqliteStore)> {
        let store = SqliteStore::open(&config.storage)?;
        let lookup = TwitchLookup::from_env(&config.twitch, RetryPolicy::from(&config.retry))?;

        let cache = Self::new(Arc::new(store.clone()), Arc::new(lookup))
            .with_policy(config.on_storage_error);
        Ok((cache, store))
    }

    /// Resolve `key` to its profile record.
    ///
    /// Storage hits never touch the external lookup. On a miss the looked-up
    /// record is returned right away and persisted in the background; a
    /// failed write is logged and reported but does not fail this call.
    pub async fn resolve(&self, key: &str) -> Result<ProfileRecord> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }

        match self.store.find_by_key(key).await {
            Ok(Some(record)) => {
                self.stats.hit();
                debug!(key, "Profile cache hit");
                return Ok(record);
            }
            Ok(None) => {
                self.stats.miss();
                debug!(key, "Profile cache miss");
            }
            Err(e) => {
                self.stats.storage_read_error();
                match self.policy {
                    StorageErrorPolicy::FailFast => {
                        warn!(key, error = %e, "Storage read failed, not falling back");
                        return Err(CacheError::StorageUnavailable(e));
                    }
                    StorageErrorPolicy::Advisory => {
                        self.stats.miss();
                        warn!(key, error = %e, "Storage read failed, falling back to lookup");
                    }
                }
            }
        }

        self.fill(key).await
    }

    async fn fill(&self, key: &str) -> Result<ProfileRecord> {
        let flight = self.join_or_start(key);

        flight.await.map_err(|source| CacheError::LookupFailed {
            key: key.to_string(),
            source,
        })
    }

    /// Join the lookup in flight for `key`, or start one
    fn join_or_start(&self, key: &str) -> Flight {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = in_flight.get(key) {
            self.stats.coalesce();
            debug!(key, "Joining lookup already in flight");
            return existing.flight.clone();
        }

        // The task's guard takes this same lock, so it cannot clear the
        // entry before it is inserted below
        let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let flight = self.start_flight(key.to_string(), id);
        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                flight: flight.clone(),
            },
        );
        flight
    }

    /// Spawn the lookup as its own task. It runs to completion, stores the
    /// record and clears its map entry even if every caller waiting on it is
    /// dropped.
    fn start_flight(&self, key: String, id: u64) -> Flight {
        let lookup = Arc::clone(&self.lookup);
        let writer = Arc::clone(&self.writer);
        let stats = Arc::clone(&self.stats);
        let guard = FlightGuard {
            flights: Arc::clone(&self.in_flight),
            key: key.clone(),
            id,
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            stats.lookup();
            let started = Instant::now();
            let result = lookup.lookup(&key).await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(record) => {
                    metrics::record_lookup_duration("ok", elapsed);
                    // Store under the key as received, whatever the upstream calls it
                    let record = record.rekeyed(key);
                    writer.submit(record.clone());
                    Ok(record)
                }
                Err(e) => {
                    metrics::record_lookup_duration("error", elapsed);
                    stats.lookup_failure();
                    warn!(key = %key, error = %e, "External profile lookup failed");
                    Err(e)
                }
            }
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(LookupError::Network(format!("lookup task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// Receive a [`WriteReport`] for every background insert from now on
    pub fn subscribe_writes(&self) -> broadcast::Receiver<WriteReport> {
        self.writer.subscribe()
    }

    /// Wait until every background insert submitted so far has finished
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Background inserts still running
    pub fn pending_writes(&self) -> usize {
        self.writer.pending()
    }

    /// Keys with a lookup currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn policy(&self) -> StorageErrorPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Lookup that answers from a fixed table and counts calls
    struct TableLookup {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl TableLookup {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExternalLookup for TableLookup {
        async fn lookup(&self, key: &str) -> std::result::Result<ProfileRecord, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match key {
                "alice" => Ok(ProfileRecord::new("alice", "Alice", "https://x/a.png")),
                "bob" => Ok(ProfileRecord::new("bob", "Bob", "https://x/b.png")),
                _ => Err(LookupError::NotFound(key.to_string())),
            }
        }
    }

    /// Store whose reads fail
    struct BrokenReads(MemoryStore);

    #[async_trait]
    impl PersistentStore for BrokenReads {
        async fn find_by_key(&self, _key: &str) -> crate::store::Result<Option<ProfileRecord>> {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        }

        async fn insert(&self, record: &ProfileRecord) -> crate::store::Result<()> {
            self.0.insert(record).await
        }
    }

    fn cache_with(store: Arc<dyn PersistentStore>, lookup: Arc<TableLookup>) -> LookasideCache {
        LookasideCache::new(store, lookup)
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let lookup = Arc::new(TableLookup::new());
        let cache = cache_with(Arc::new(MemoryStore::new()), Arc::clone(&lookup));

        let err = cache.resolve("").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let store = Arc::new(MemoryStore::new());
        let lookup = Arc::new(TableLookup::new());
        let cache = cache_with(store.clone(), Arc::clone(&lookup));

        let first = cache.resolve("alice").await.unwrap();
        cache.flush().await;
        let second = cache.resolve("alice").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(lookup.calls(), 1);
        assert!(store.contains("alice"));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_record_is_filed_under_requested_key() {
        struct Lowercasing;

        #[async_trait]
        impl ExternalLookup for Lowercasing {
            async fn lookup(&self, key: &str) -> std::result::Result<ProfileRecord, LookupError> {
                Ok(ProfileRecord::new(key.to_lowercase(), key, "https://x/c.png"))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let cache = LookasideCache::new(store.clone(), Arc::new(Lowercasing));

        let record = cache.resolve("CarolStreams").await.unwrap();
        cache.flush().await;

        assert_eq!(record.key, "CarolStreams");
        assert!(store.contains("CarolStreams"));
        assert!(!store.contains("carolstreams"));
    }

    #[tokio::test]
    async fn test_advisory_read_error_falls_through() {
        let lookup = Arc::new(TableLookup::new());
        let cache = cache_with(
            Arc::new(BrokenReads(MemoryStore::new())),
            Arc::clone(&lookup),
        );

        let record = cache.resolve("bob").await.unwrap();
        assert_eq!(record.display_name, "Bob");
        assert_eq!(lookup.calls(), 1);
        assert_eq!(cache.stats().storage_read_errors, 1);
    }

    #[tokio::test]
    async fn test_fail_fast_read_error_skips_lookup() {
        let lookup = Arc::new(TableLookup::new());
        let cache = cache_with(
            Arc::new(BrokenReads(MemoryStore::new())),
            Arc::clone(&lookup),
        )
        .with_policy(StorageErrorPolicy::FailFast);

        let err = cache.resolve("bob").await.unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable(_)));
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_lookup() {
        let store = Arc::new(MemoryStore::new());
        let lookup = Arc::new(TableLookup::slow(Duration::from_millis(100)));
        let cache = Arc::new(cache_with(store.clone(), Arc::clone(&lookup)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.resolve("bob").await })
            })
            .collect();

        for task in tasks {
            let record = task.await.unwrap().unwrap();
            assert_eq!(record.display_name, "Bob");
        }
        cache.flush().await;

        assert_eq!(lookup.calls(), 1);
        assert_eq!(store.len(), 1);
        let stats = cache.stats();
        assert_eq!(stats.lookups, 1);
        assert_eq!(stats.coalesced + stats.hits, 7);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_coalesce() {
        let lookup = Arc::new(TableLookup::slow(Duration::from_millis(20)));
        let cache = cache_with(Arc::new(MemoryStore::new()), Arc::clone(&lookup));

        let (a, b) = tokio::join!(cache.resolve("alice"), cache.resolve("bob"));
        assert_eq!(a.unwrap().display_name, "Alice");
        assert_eq!(b.unwrap().display_name, "Bob");
        assert_eq!(lookup.calls(), 2);
        assert_eq!(cache.stats().coalesced, 0);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_strand_waiters() {
        let lookup = Arc::new(TableLookup::slow(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(Arc::new(MemoryStore::new()), Arc::clone(&lookup)));

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.resolve("alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.resolve("alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let record = follower.await.unwrap().unwrap();
        assert_eq!(record.display_name, "Alice");
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_sole_caller_still_fills_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let lookup = Arc::new(TableLookup::slow(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(store.clone(), Arc::clone(&lookup)));

        let caller = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.resolve("alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cache.flush().await;

        assert_eq!(cache.in_flight(), 0);
        assert!(store.contains("alice"));
        assert_eq!(lookup.calls(), 1);

        // Next caller is a plain hit, not a join on a stale flight
        let record = cache.resolve("alice").await.unwrap();
        assert_eq!(record.display_name, "Alice");
        assert_eq!(lookup.calls(), 1);
        assert_eq!(cache.stats().coalesced, 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_not_cached_and_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        let lookup = Arc::new(TableLookup::new());
        let cache = cache_with(store.clone(), Arc::clone(&lookup));

        assert!(cache.resolve("ghost").await.unwrap_err().is_not_found());
        assert!(cache.resolve("ghost").await.unwrap_err().is_not_found());
        cache.flush().await;

        assert!(store.is_empty());
        assert_eq!(lookup.calls(), 2);
        assert_eq!(cache.stats().lookup_failures, 2);
    }
}
