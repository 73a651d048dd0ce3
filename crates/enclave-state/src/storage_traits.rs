//! Storage trait definitions for Enclave
//!
//! These traits define the core storage abstractions:
//! - `StateStore`: keyed JSON records grouped in collections, with filtered scans
//! - `AuditSink`: append-only audit trail for security decisions
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Well-known collection names.
pub mod collections {
    pub const SANDBOXES: &str = "sandboxes";
    pub const BUDGET_LEDGERS: &str = "budget_ledgers";
    pub const DELEGATION: &str = "delegation";
    pub const AUDIT_LOG: &str = "audit_log";
}

// ---------------------------------------------------------------------------
// StateStore — keyed records + filtered scan
// ---------------------------------------------------------------------------

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

/// A single top-level field predicate. All filters passed to
/// [`StateStore::query`] must match for a record to be returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Lt,
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gt,
            value: value.into(),
        }
    }

    /// Evaluate this predicate against a record.
    ///
    /// A missing field never satisfies `Eq`, `Lt` or `Gt`, and always
    /// satisfies `Ne`. Ordering comparisons are defined for numbers and
    /// strings only.
    pub fn matches(&self, record: &Value) -> bool {
        let Some(actual) = record.get(&self.field) else {
            return self.op == FilterOp::Ne;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Durable keyed state.
///
/// Guarantees:
/// - `set` replaces any previous record under the same `(collection, key)`.
/// - `get` returns the last record written, or `None`.
/// - `query` returns every record in `collection` matching all `filters`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a single record.
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Value>>;

    /// Insert or replace a record.
    async fn set(&self, collection: &str, key: &str, record: Value) -> StorageResult<()>;

    /// Scan a collection, keeping records that satisfy every filter.
    async fn query(&self, collection: &str, filters: &[Filter]) -> StorageResult<Vec<Value>>;
}

// ---------------------------------------------------------------------------
// AuditSink — append-only audit trail
// ---------------------------------------------------------------------------

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny,
}

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Who asked (agent id or caller identity).
    pub actor: String,
    /// What was attempted, e.g. `"sandbox.execute"`.
    pub action: String,
    /// What it was attempted on, e.g. a sandbox id.
    pub resource: String,
    pub decision: AuditDecision,
    pub matched_patterns: Vec<String>,
    /// Highest severity among matches, if any.
    pub severity: Option<String>,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        decision: AuditDecision,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            decision,
            matched_patterns: Vec::new(),
            severity: None,
        }
    }
}

/// Append-only audit trail.
///
/// Callers treat this as fire-and-forget: an error returned here must be
/// logged and dropped, never surfaced to the caller of the audited action.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eq_and_ne_filters() {
        let rec = json!({"status": "ready", "count": 3});
        assert!(Filter::eq("status", "ready").matches(&rec));
        assert!(!Filter::eq("status", "error").matches(&rec));
        assert!(Filter::ne("status", "terminated").matches(&rec));
        assert!(!Filter::ne("status", "ready").matches(&rec));
    }

    #[test]
    fn test_missing_field_semantics() {
        let rec = json!({"status": "ready"});
        assert!(!Filter::eq("agent_id", "x").matches(&rec));
        assert!(Filter::ne("agent_id", "x").matches(&rec));
        assert!(!Filter::lt("agent_id", 1).matches(&rec));
    }

    #[test]
    fn test_ordering_filters() {
        let rec = json!({"count": 3, "name": "beta"});
        assert!(Filter::lt("count", 4).matches(&rec));
        assert!(Filter::gt("count", 2.5).matches(&rec));
        assert!(!Filter::gt("count", 3).matches(&rec));
        assert!(Filter::gt("name", "alpha").matches(&rec));
        // Mixed types are incomparable.
        assert!(!Filter::lt("name", 10).matches(&rec));
    }

    #[test]
    fn test_audit_record_new_has_unique_ids() {
        let a = AuditRecord::new("agent", "sandbox.execute", "sb-1", AuditDecision::Allow);
        let b = AuditRecord::new("agent", "sandbox.execute", "sb-1", AuditDecision::Allow);
        assert_ne!(a.id, b.id);
        assert!(a.matched_patterns.is_empty());
    }
}
