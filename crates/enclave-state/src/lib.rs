//! Enclave-State: persistence layer for the Enclave sandbox manager.
//!
//! Everything durable about the system (sandbox records, budget ledgers,
//! delegation state, audit trail) flows through the two contracts defined
//! here, so the domain layer never depends on a storage technology.
//!
//! ## Layer 0 - Data/Persistence
//!
//! ## Key Components
//!
//! - `StateStore`: single-key get/set plus filtered scans over a collection
//! - `AuditSink`: append-only audit trail
//! - `SurrealStateStore`: SurrealDB-backed `StateStore`
//! - `fakes`: in-memory implementations for tests

pub mod audit;
mod error;
pub mod fakes;
mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use audit::StoreAuditSink;
pub use error::StorageError;
pub use storage_traits::{
    collections, AuditDecision, AuditRecord, AuditSink, Filter, FilterOp, StateStore,
    StorageResult,
};
pub use surreal_store::SurrealStateStore;
