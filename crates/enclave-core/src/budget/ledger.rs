//! Per-agent ledger state and its transition rules.
//!
//! Pure data: no locking or I/O here. [`super::BudgetManager`] serializes
//! access and persists after each mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EnclaveError, EnclaveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Reserve,
    Commit,
    Rollback,
    Spend,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Reserve => write!(f, "reserve"),
            TransactionKind::Commit => write!(f, "commit"),
            TransactionKind::Rollback => write!(f, "rollback"),
            TransactionKind::Spend => write!(f, "spend"),
        }
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetTransaction {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub amount: u64,
    pub kind: TransactionKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Funds held for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub amount: u64,
    pub reserved_at: DateTime<Utc>,
}

/// One agent's account. Invariant: `spent + reserved <= initial`, and
/// `reserved` equals the sum of outstanding `reservations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub agent_id: String,
    pub initial: u64,
    pub spent: u64,
    pub reserved: u64,
    pub transactions: Vec<BudgetTransaction>,
    #[serde(default)]
    pub reservations: BTreeMap<String, Reservation>,
}

impl BudgetLedger {
    pub fn new(agent_id: impl Into<String>, initial: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            initial,
            spent: 0,
            reserved: 0,
            transactions: Vec::new(),
            reservations: BTreeMap::new(),
        }
    }

    /// Funds neither spent nor reserved.
    pub fn available(&self) -> u64 {
        self.initial
            .saturating_sub(self.spent)
            .saturating_sub(self.reserved)
    }

    pub fn can_afford(&self, amount: u64) -> bool {
        amount <= self.available()
    }

    /// Hold `amount` for `task_id`. Returns `false` (and changes nothing)
    /// when the funds are not available. Reserving again for the same task
    /// adds to its existing hold.
    pub fn reserve(&mut self, task_id: &str, amount: u64, now: DateTime<Utc>) -> bool {
        if !self.can_afford(amount) {
            return false;
        }
        self.reserved += amount;
        self.reservations
            .entry(task_id.to_string())
            .and_modify(|r| r.amount += amount)
            .or_insert(Reservation {
                amount,
                reserved_at: now,
            });
        self.record(task_id, amount, TransactionKind::Reserve, now, None);
        true
    }

    /// Move `amount` of `task_id`'s hold into `spent`. Any remainder of the
    /// hold stays reserved under the same task.
    pub fn commit(&mut self, task_id: &str, amount: u64, now: DateTime<Utc>) -> EnclaveResult<()> {
        self.take_from_reservation(task_id, amount)?;
        self.spent += amount;
        self.record(task_id, amount, TransactionKind::Commit, now, None);
        Ok(())
    }

    /// Release `amount` of `task_id`'s hold without spending it.
    pub fn rollback(
        &mut self,
        task_id: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> EnclaveResult<()> {
        self.take_from_reservation(task_id, amount)?;
        self.record(task_id, amount, TransactionKind::Rollback, now, None);
        Ok(())
    }

    /// Spend directly, without a prior reservation.
    pub fn spend(&mut self, task_id: &str, amount: u64, now: DateTime<Utc>) -> bool {
        if !self.can_afford(amount) {
            return false;
        }
        self.spent += amount;
        self.record(task_id, amount, TransactionKind::Spend, now, None);
        true
    }

    /// Roll back every hold taken at or before `cutoff`. Returns the
    /// released `(task_id, amount)` pairs.
    pub fn expire_reservations(
        &mut self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<(String, u64)> {
        let stale: Vec<(String, u64)> = self
            .reservations
            .iter()
            .filter(|(_, r)| r.reserved_at <= cutoff)
            .map(|(task, r)| (task.clone(), r.amount))
            .collect();

        for (task_id, amount) in &stale {
            self.reservations.remove(task_id);
            self.reserved = self.reserved.saturating_sub(*amount);
            self.record(
                task_id,
                *amount,
                TransactionKind::Rollback,
                now,
                Some("expired".to_string()),
            );
        }
        stale
    }

    fn take_from_reservation(&mut self, task_id: &str, amount: u64) -> EnclaveResult<()> {
        let held = self
            .reservations
            .get(task_id)
            .map(|r| r.amount)
            .ok_or_else(|| EnclaveError::NotFound {
                kind: "reservation",
                id: format!("{}/{}", self.agent_id, task_id),
            })?;
        if amount > held {
            return Err(EnclaveError::Overcommit {
                agent_id: self.agent_id.clone(),
                task_id: task_id.to_string(),
                requested: amount,
                reserved: held,
            });
        }
        if amount == held {
            self.reservations.remove(task_id);
        } else if let Some(r) = self.reservations.get_mut(task_id) {
            r.amount -= amount;
        }
        self.reserved -= amount;
        Ok(())
    }

    fn record(
        &mut self,
        task_id: &str,
        amount: u64,
        kind: TransactionKind,
        now: DateTime<Utc>,
        note: Option<String>,
    ) {
        self.transactions.push(BudgetTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: self.agent_id.clone(),
            task_id: task_id.to_string(),
            amount,
            kind,
            timestamp: now,
            note,
        });
        debug_assert!(self.spent + self.reserved <= self.initial);
    }
}
