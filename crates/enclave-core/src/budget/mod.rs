//! Per-agent budget accounting.
//!
//! Each agent has one [`BudgetLedger`], created lazily with its configured
//! allocation (or hydrated from the store) and guarded by its own async
//! mutex. Every mutation for an agent runs under that mutex and is followed
//! by a best-effort persistence write, so two concurrent reservations can
//! never both draw on the same remaining balance.

mod ledger;

pub use ledger::{BudgetLedger, BudgetTransaction, Reservation, TransactionKind};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use enclave_state::collections;

use crate::error::EnclaveResult;
use crate::obs::emit_budget_transaction;
use crate::persist::Persister;

type LedgerHandle = Arc<Mutex<BudgetLedger>>;

pub struct BudgetManager {
    default_initial: u64,
    overrides: HashMap<String, u64>,
    ledgers: Mutex<HashMap<String, LedgerHandle>>,
    persister: Arc<Persister>,
}

impl BudgetManager {
    pub fn new(
        default_initial: u64,
        overrides: HashMap<String, u64>,
        persister: Arc<Persister>,
    ) -> Self {
        Self {
            default_initial,
            overrides,
            ledgers: Mutex::new(HashMap::new()),
            persister,
        }
    }

    /// Configured allocation for a ledger that does not exist yet.
    pub fn initial_for(&self, agent_id: &str) -> u64 {
        self.overrides
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_initial)
    }

    pub async fn can_afford(&self, agent_id: &str, amount: u64) -> bool {
        let handle = self.handle(agent_id).await;
        let ledger = handle.lock().await;
        ledger.can_afford(amount)
    }

    /// Hold `amount` for `task_id`. `false` means insufficient funds; the
    /// ledger is left untouched.
    #[instrument(skip(self))]
    pub async fn reserve(&self, agent_id: &str, amount: u64, task_id: &str) -> bool {
        let handle = self.handle(agent_id).await;
        let mut ledger = handle.lock().await;
        if !ledger.reserve(task_id, amount, Utc::now()) {
            debug!(available = ledger.available(), "reservation refused");
            return false;
        }
        self.after_mutation(&ledger, TransactionKind::Reserve, amount, task_id);
        true
    }

    #[instrument(skip(self))]
    pub async fn commit(&self, agent_id: &str, amount: u64, task_id: &str) -> EnclaveResult<()> {
        let handle = self.handle(agent_id).await;
        let mut ledger = handle.lock().await;
        ledger.commit(task_id, amount, Utc::now())?;
        self.after_mutation(&ledger, TransactionKind::Commit, amount, task_id);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rollback(&self, agent_id: &str, amount: u64, task_id: &str) -> EnclaveResult<()> {
        let handle = self.handle(agent_id).await;
        let mut ledger = handle.lock().await;
        ledger.rollback(task_id, amount, Utc::now())?;
        self.after_mutation(&ledger, TransactionKind::Rollback, amount, task_id);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn spend(&self, agent_id: &str, amount: u64, task_id: &str) -> bool {
        let handle = self.handle(agent_id).await;
        let mut ledger = handle.lock().await;
        if !ledger.spend(task_id, amount, Utc::now()) {
            return false;
        }
        self.after_mutation(&ledger, TransactionKind::Spend, amount, task_id);
        true
    }

    /// Snapshot of the agent's ledger, creating it if needed.
    pub async fn ledger(&self, agent_id: &str) -> BudgetLedger {
        let handle = self.handle(agent_id).await;
        let ledger = handle.lock().await;
        ledger.clone()
    }

    /// Roll back reservations taken before `now - ttl` across all loaded
    /// ledgers. Returns the number of reservations released.
    pub async fn expire_reservations(&self, now: DateTime<Utc>, ttl: chrono::TimeDelta) -> usize {
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };
        let handles: Vec<LedgerHandle> = self.ledgers.lock().await.values().cloned().collect();

        let mut released = 0;
        for handle in handles {
            let mut ledger = handle.lock().await;
            let expired = ledger.expire_reservations(cutoff, now);
            if expired.is_empty() {
                continue;
            }
            for (task_id, amount) in &expired {
                emit_budget_transaction(&ledger.agent_id, "rollback", *amount, task_id);
            }
            released += expired.len();
            self.persister
                .write(collections::BUDGET_LEDGERS, &ledger.agent_id, &*ledger);
        }
        released
    }

    async fn handle(&self, agent_id: &str) -> LedgerHandle {
        if let Some(h) = self.ledgers.lock().await.get(agent_id) {
            return h.clone();
        }

        // Hydrate outside the map lock; the first insert wins a race.
        let loaded = self
            .persister
            .read::<BudgetLedger>(collections::BUDGET_LEDGERS, agent_id)
            .await
            .unwrap_or_else(|| BudgetLedger::new(agent_id, self.initial_for(agent_id)));

        self.ledgers
            .lock()
            .await
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone()
    }

    /// Runs under the agent's lock, so queued writes follow mutation order.
    fn after_mutation(
        &self,
        ledger: &BudgetLedger,
        kind: TransactionKind,
        amount: u64,
        task_id: &str,
    ) {
        emit_budget_transaction(&ledger.agent_id, &kind.to_string(), amount, task_id);
        self.persister
            .write(collections::BUDGET_LEDGERS, &ledger.agent_id, ledger);
    }
}
