//! Audit sink backed by a [`StateStore`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::storage_traits::{collections, AuditRecord, AuditSink, StateStore, StorageResult};

/// Appends audit records into the `audit_log` collection of a state store,
/// keyed by record id so an entry is never overwritten.
pub struct StoreAuditSink {
    store: Arc<dyn StateStore>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn append(&self, record: AuditRecord) -> StorageResult<()> {
        let key = record.id.clone();
        let value = serde_json::to_value(&record)?;
        self.store.set(collections::AUDIT_LOG, &key, value).await
    }
}
