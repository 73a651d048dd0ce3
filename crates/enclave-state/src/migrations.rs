//! SurrealDB schema initialization
//!
//! All collections share one table; a record's identity is the pair
//! `(collection, key)`, which is also encoded into the SurrealDB record id.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Table holding every `StateStore` record.
pub(crate) const STATE_TABLE: &str = "state_records";

/// Initialize all Enclave tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub(crate) async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Enclave SurrealDB schema");
    init_state_records_table(db).await?;
    info!("Enclave schema initialization complete");
    Ok(())
}

/// Initialize `state_records` table with indexes
///
/// Schema:
/// ```text
/// TABLE state_records {
///   collection:  STRING (indexed)
///   key:         STRING
///   body:        STRING (JSON-encoded record)
/// }
/// ```
///
/// Constraints:
/// - `(collection, key)` is unique
async fn init_state_records_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing state_records table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS state_records SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_collection ON TABLE state_records COLUMNS collection;
        DEFINE INDEX IF NOT EXISTS idx_collection_key ON TABLE state_records COLUMNS collection, key UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;
    info!("state_records table initialized");
    Ok(())
}
