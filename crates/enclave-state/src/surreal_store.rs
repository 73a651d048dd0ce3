//! SurrealDB-backed StateStore implementation
//!
//! Records are stored JSON-encoded in a single table; filtering for
//! [`StateStore::query`] is applied after the collection scan so the filter
//! semantics are identical to the in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations::{self, STATE_TABLE};
use crate::storage_traits::{Filter, StateStore, StorageResult};

const NAMESPACE: &str = "enclave";
const DATABASE: &str = "main";

/// Row shape persisted in `state_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    collection: String,
    key: String,
    body: String,
}

impl StoredRow {
    fn decode(self) -> StorageResult<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// SurrealDB-backed implementation of [`StateStore`].
pub struct SurrealStateStore {
    db: Surreal<Any>,
}

impl SurrealStateStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `enclave/main`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint understood by the `any` engine
    /// (`mem://`, `surrealkv://path`, `ws://host:port`, ...).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url = %url, "SurrealStateStore connected");
        Ok(Self { db })
    }

    fn record_id(collection: &str, key: &str) -> String {
        format!("{collection}/{key}")
    }
}

#[async_trait]
impl StateStore for SurrealStateStore {
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Value>> {
        let mut res = self
            .db
            .query("SELECT collection, key, body FROM state_records WHERE collection = $c AND key = $k")
            .bind(("c", collection.to_string()))
            .bind(("k", key.to_string()))
            .await?;

        let rows: Vec<StoredRow> = res.take(0)?;
        rows.into_iter().next().map(StoredRow::decode).transpose()
    }

    async fn set(&self, collection: &str, key: &str, record: Value) -> StorageResult<()> {
        let row = StoredRow {
            collection: collection.to_string(),
            key: key.to_string(),
            body: serde_json::to_string(&record)?,
        };
        debug!(collection = %collection, key = %key, "upserting state record");

        self.db
            .query("UPSERT type::thing($tb, $rid) CONTENT $row")
            .bind(("tb", STATE_TABLE))
            .bind(("rid", Self::record_id(collection, key)))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> StorageResult<Vec<Value>> {
        let mut res = self
            .db
            .query("SELECT collection, key, body FROM state_records WHERE collection = $c ORDER BY key ASC")
            .bind(("c", collection.to_string()))
            .await?;

        let rows: Vec<StoredRow> = res.take(0)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value = row.decode()?;
            if filters.iter().all(|f| f.matches(&value)) {
                out.push(value);
            }
        }
        Ok(out)
    }
}
