//! Background persistence of freshly looked-up records
//!
//! A successful lookup hands its record here and returns immediately. The
//! insert runs as its own task; its outcome is logged, counted and published
//! to anyone subscribed via [`WriteBehind::subscribe`].

use super::stats::StatsCounters;
use crate::profile::ProfileRecord;
use crate::store::PersistentStore;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Result of one background insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    Failed(String),
}

/// Published after every background insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub key: String,
    pub outcome: WriteOutcome,
}

pub(crate) struct WriteBehind {
    store: Arc<dyn PersistentStore>,
    stats: Arc<StatsCounters>,
    reports: broadcast::Sender<WriteReport>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBehind {
    pub(crate) fn new(store: Arc<dyn PersistentStore>, stats: Arc<StatsCounters>) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            store,
            stats,
            reports,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WriteReport> {
        self.reports.subscribe()
    }

    /// Spawn the insert for `record`. Must be called from within a tokio runtime.
    pub(crate) fn submit(&self, record: ProfileRecord) {
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let reports = self.reports.clone();

        let handle = tokio::spawn(async move {
            let outcome = match store.insert(&record).await {
                Ok(()) => {
                    stats.write();
                    debug!(key = %record.key, "Profile record persisted");
                    WriteOutcome::Stored
                }
                Err(e) => {
                    stats.write_failure();
                    warn!(key = %record.key, error = %e, "Failed to persist profile record");
                    WriteOutcome::Failed(e.to_string())
                }
            };
            // No subscribers is fine
            let _ = reports.send(WriteReport {
                key: record.key,
                outcome,
            });
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Number of inserts not yet finished
    pub(crate) fn pending(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.len()
    }

    /// Wait for every insert submitted so far
    pub(crate) async fn flush(&self) {
        let handles = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Persistence task did not complete");
            }
        }
    }
}
