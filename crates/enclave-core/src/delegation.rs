//! Shared cross-agent coordination state.
//!
//! A single JSON object that agents read and patch. Patches are shallow:
//! each top-level key replaces the stored one, and a `null` value removes it.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use enclave_state::collections;

use crate::error::{EnclaveError, EnclaveResult};
use crate::persist::Persister;

const STATE_KEY: &str = "state";

pub struct DelegationBoard {
    state: RwLock<Map<String, Value>>,
    persister: Arc<Persister>,
}

impl DelegationBoard {
    pub fn new(persister: Arc<Persister>) -> Self {
        Self {
            state: RwLock::new(Map::new()),
            persister,
        }
    }

    /// Replace in-memory state with the stored copy, if there is one.
    pub async fn hydrate(&self) -> bool {
        match self
            .persister
            .read::<Map<String, Value>>(collections::DELEGATION, STATE_KEY)
            .await
        {
            Some(stored) => {
                *self.state.write().await = stored;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self) -> Value {
        Value::Object(self.state.read().await.clone())
    }

    /// Apply `patch` (a JSON object) and return the merged state. The
    /// snapshot is queued for the store before the lock is released.
    pub async fn merge(&self, patch: Value) -> EnclaveResult<Value> {
        let Value::Object(patch) = patch else {
            return Err(EnclaveError::InvalidRequest(
                "delegation patch must be a JSON object".into(),
            ));
        };

        let merged = {
            let mut state = self.state.write().await;
            for (key, value) in patch {
                if value.is_null() {
                    state.remove(&key);
                } else {
                    state.insert(key, value);
                }
            }
            self.persister
                .write(collections::DELEGATION, STATE_KEY, &*state);
            state.clone()
        };
        debug!(keys = merged.len(), "delegation state merged");
        Ok(Value::Object(merged))
    }
}
