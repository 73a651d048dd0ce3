//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryStateStore` and `MemoryAuditSink` that satisfy the trait
//! contracts without any external dependencies. Both can be switched into an
//! "unavailable" mode to exercise degraded-persistence paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory store backed by `collection → (key → record)` maps.
#[derive(Debug)]
pub struct MemoryStateStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    available: AtomicBool,
    stalled: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability. While unavailable every call fails
    /// with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// While stalled, `set` never completes (a hung connection).
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of successful `set` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Value>> {
        self.check()?;
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn set(&self, collection: &str, key: &str, record: Value) -> StorageResult<()> {
        self.check()?;
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> StorageResult<Vec<Value>> {
        self.check()?;
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|rec| filters.iter().all(|f| f.matches(rec)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryAuditSink
// ---------------------------------------------------------------------------

/// In-memory audit sink that keeps every appended record in order.
#[derive(Debug)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    available: AtomicBool,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every `append` fails.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.available.store(false, Ordering::SeqCst);
        sink
    }

    /// Snapshot of all records appended so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> StorageResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("audit sink offline".into()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
