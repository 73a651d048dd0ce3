//! Write-behind persistence over a [`StateStore`].
//!
//! In-memory state is authoritative for the running process. Callers only
//! enqueue: [`Persister::write`] records the latest value for a key and wakes
//! a background writer task, so no caller waits on the store. The writer
//! sends the newest value per key, each store call bounded by a timeout. A
//! failed write stays parked until [`Persister::flush_pending`] retries it.
//!
//! `write` is synchronous so callers can queue a snapshot while still holding
//! the lock that produced it. Writes to a key then reach the store in the
//! order the snapshots were taken, and a slow attempt never overwrites a
//! newer value queued behind it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use enclave_state::{Filter, StateStore, StorageError};

use crate::obs::emit_persist_deferred;

type PendingKey = (String, String);

#[derive(Default)]
struct Slot {
    /// Last accepted version for the key.
    version: u64,
    /// Value not yet confirmed by the store.
    value: Option<Value>,
    /// A writer job for this key is queued.
    queued: bool,
    /// The last attempt to store `value` failed.
    failed: bool,
}

enum Job {
    Write(PendingKey),
    Barrier(oneshot::Sender<()>),
}

struct Shared {
    store: Arc<dyn StateStore>,
    timeout: Duration,
    slots: Mutex<BTreeMap<PendingKey, Slot>>,
}

pub struct Persister {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
    /// Taken when the writer task is spawned on first use.
    idle_writer: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

impl Persister {
    pub fn new(store: Arc<dyn StateStore>, timeout: Duration) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                store,
                timeout,
                slots: Mutex::new(BTreeMap::new()),
            }),
            jobs,
            idle_writer: Mutex::new(Some(rx)),
        }
    }

    /// Queue a write. Writes to one key are applied in call order.
    pub fn write<T: Serialize>(&self, collection: &str, key: &str, record: &T) {
        let Some(value) = encode(collection, key, record) else {
            return;
        };
        let mut slots = lock(&self.shared.slots);
        let slot = slots
            .entry((collection.to_string(), key.to_string()))
            .or_default();
        self.accept(slot, collection, key, value);
    }

    fn accept(&self, slot: &mut Slot, collection: &str, key: &str, value: Value) {
        slot.version += 1;
        slot.value = Some(value);
        slot.failed = false;
        if !slot.queued {
            slot.queued = true;
            self.enqueue(Job::Write((collection.to_string(), key.to_string())));
        }
    }

    /// Read a record, preferring a value the store has not confirmed yet.
    /// Store failures and undecodable records read as `None`.
    pub async fn read<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Option<T> {
        let parked = lock(&self.shared.slots)
            .get(&(collection.to_string(), key.to_string()))
            .and_then(|slot| slot.value.clone());
        let value = match parked {
            Some(v) => v,
            None => match tokio::time::timeout(
                self.shared.timeout,
                self.shared.store.get(collection, key),
            )
            .await
            {
                Ok(Ok(v)) => v?,
                Ok(Err(e)) => {
                    warn!(collection = %collection, key = %key, error = %e, "store read failed");
                    return None;
                }
                Err(_) => {
                    warn!(collection = %collection, key = %key, "store read timed out");
                    return None;
                }
            },
        };
        decode(collection, value)
    }

    /// Filtered scan. Store failures read as an empty result.
    pub async fn scan<T: DeserializeOwned>(&self, collection: &str, filters: &[Filter]) -> Vec<T> {
        let rows = match tokio::time::timeout(
            self.shared.timeout,
            self.shared.store.query(collection, filters),
        )
        .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(collection = %collection, error = %e, "store scan failed");
                return Vec::new();
            }
            Err(_) => {
                warn!(collection = %collection, "store scan timed out");
                return Vec::new();
            }
        };
        rows.into_iter()
            .filter_map(|v| decode(collection, v))
            .collect()
    }

    /// Requeue failed writes and wait until everything queued so far has
    /// been attempted. Returns how many writes are still failing.
    pub async fn flush_pending(&self) -> usize {
        {
            let mut slots = lock(&self.shared.slots);
            for (pk, slot) in slots.iter_mut() {
                if slot.failed && slot.value.is_some() && !slot.queued {
                    slot.queued = true;
                    self.enqueue(Job::Write(pk.clone()));
                }
            }
        }
        let (done, drained) = oneshot::channel();
        if self.enqueue(Job::Barrier(done)) {
            let _ = drained.await;
        }
        self.pending_len()
    }

    /// Writes whose last attempt failed.
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.slots)
            .values()
            .filter(|s| s.failed && s.value.is_some())
            .count()
    }

    fn enqueue(&self, job: Job) -> bool {
        self.ensure_writer();
        if self.jobs.send(job).is_err() {
            warn!("persistence writer stopped, write not queued");
            return false;
        }
        true
    }

    fn ensure_writer(&self) {
        let mut idle = lock(&self.idle_writer);
        if idle.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if let Some(rx) = idle.take() {
                    handle.spawn(run_writer(Arc::clone(&self.shared), rx));
                }
            }
            Err(_) => debug!("no runtime yet, persistence writer deferred"),
        }
    }
}

async fn run_writer(shared: Arc<Shared>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Write(pk) => shared.write_latest(pk).await,
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("persistence writer stopped");
}

impl Shared {
    async fn write_latest(&self, pk: PendingKey) {
        let taken = {
            let mut slots = lock(&self.slots);
            slots.get_mut(&pk).and_then(|slot| {
                slot.queued = false;
                slot.value.clone().map(|v| (slot.version, v))
            })
        };
        let Some((version, value)) = taken else {
            return;
        };

        let outcome = self.set_bounded(&pk.0, &pk.1, value).await;

        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&pk) else {
            return;
        };
        // A newer value arrived meanwhile and has queued its own job.
        if slot.version != version {
            return;
        }
        match outcome {
            Ok(()) => {
                slot.value = None;
                slot.failed = false;
            }
            Err(e) => {
                if !slot.failed {
                    emit_persist_deferred(&pk.0, &pk.1, &e);
                }
                slot.failed = true;
            }
        }
    }

    async fn set_bounded(&self, collection: &str, key: &str, value: Value) -> Result<(), StorageError> {
        match tokio::time::timeout(self.timeout, self.store.set(collection, key, value)).await {
            Ok(res) => res,
            Err(_) => Err(StorageError::Unavailable(format!(
                "write timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode<T: Serialize>(collection: &str, key: &str, record: &T) -> Option<Value> {
    match serde_json::to_value(record) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(collection = %collection, key = %key, error = %e, "record not serializable, dropped");
            None
        }
    }
}

fn decode<T: DeserializeOwned>(collection: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(collection = %collection, error = %e, "stored record could not be decoded");
            None
        }
    }
}
