//! In-process profile store

use super::{PersistentStore, Result, StoreError};
use crate::profile::ProfileRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// `HashMap`-backed store with the same first-write-wins semantics as SQLite.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ProfileRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `records`
    pub fn with_records(records: impl IntoIterator<Item = ProfileRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect::<HashMap<_, _>>();
        Self {
            records: RwLock::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records
            .read()
            .map(|r| r.contains_key(key))
            .unwrap_or(false)
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<ProfileRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(key).cloned())
    }

    async fn insert(&self, record: &ProfileRecord) -> Result<()> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records
            .entry(record.key.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }
}
