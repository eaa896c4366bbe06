//! Transaction journal
//!
//! This module provides the append-only `TransactionStore`. Every settlement
//! attempt leaves exactly one record here, including rejected ones.
//!
//! # Write-Ahead Stages
//!
//! While a transaction is `Pending` its `stage` records how far settlement got
//! (`Recorded`, `Debited`, `Credited`). The engine advances the stage right
//! after each balance step, so after a crash recovery can tell what was applied
//! by reading the journal alone.
//!
//! # Status Guard
//!
//! A record moves from `Pending` to exactly one terminal status. Any attempt to
//! change a terminal record fails with `TerminalStatus`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::types::{
    FailureReason, LedgerError, LedgerId, OrderId, SettlementStage, Transaction, TransactionId,
    TransactionRequest, TransactionStatus,
};
use rust_decimal::Decimal;

#[derive(Debug, Default)]
pub struct TransactionStore {
    transactions: DashMap<TransactionId, Transaction>,
    by_order: DashMap<OrderId, Vec<TransactionId>>,
    next_id: AtomicU64,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `Pending` record at stage `Recorded`
    ///
    /// # Arguments
    ///
    /// * `request` - The request being settled
    /// * `credited_amount` - What the destination will receive, in its token
    pub fn open(&self, request: &TransactionRequest, credited_amount: Decimal) -> Transaction {
        let tx = Transaction::pending(self.allocate_id(), request, credited_amount);
        self.append(tx.clone());
        debug!(tx = tx.id, from = tx.from_fund_id, to = tx.to_fund_id, "transaction recorded");
        tx
    }

    /// Append a terminal record for a request that never reached the atomic phase
    pub fn record_rejected(&self, request: &TransactionRequest, reason: FailureReason) -> Transaction {
        let tx = Transaction::rejected(self.allocate_id(), request, reason);
        self.append(tx.clone());
        tx
    }

    /// Move a pending record forward to `stage`
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown id, `TerminalStatus` if the
    /// record is already resolved, `IntegrityViolation` if `stage` would move
    /// backwards.
    pub fn advance(&self, id: TransactionId, stage: SettlementStage) -> Result<(), LedgerError> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound { tx: id })?;

        if entry.status.is_terminal() {
            return Err(LedgerError::TerminalStatus {
                tx: id,
                status: entry.status,
                requested: TransactionStatus::Pending,
            });
        }
        if stage < entry.stage {
            return Err(LedgerError::IntegrityViolation {
                tx: id,
                message: format!("stage cannot move from {:?} to {:?}", entry.stage, stage),
            });
        }
        entry.stage = stage;
        Ok(())
    }

    /// Resolve a pending record to a terminal status
    ///
    /// # Errors
    ///
    /// Returns `TerminalStatus` if the record is already terminal or `status`
    /// is `Pending`.
    pub fn resolve(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        failure: Option<FailureReason>,
    ) -> Result<Transaction, LedgerError> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound { tx: id })?;

        if entry.status.is_terminal() || !status.is_terminal() {
            return Err(LedgerError::TerminalStatus {
                tx: id,
                status: entry.status,
                requested: status,
            });
        }
        entry.status = status;
        entry.failure = failure;
        debug!(tx = id, status = status.as_str(), "transaction resolved");
        Ok(entry.clone())
    }

    pub fn get(&self, id: TransactionId) -> Result<Transaction, LedgerError> {
        self.transactions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(LedgerError::TransactionNotFound { tx: id })
    }

    /// Records still `Pending`, oldest first
    pub fn pending(&self) -> Vec<Transaction> {
        self.collect(|tx| tx.status == TransactionStatus::Pending)
    }

    pub fn of_ledger(&self, ledger: LedgerId) -> Vec<Transaction> {
        self.collect(|tx| tx.ledger_id == ledger)
    }

    /// Every attempt made for an order, oldest first
    pub fn of_order(&self, order: OrderId) -> Vec<Transaction> {
        let ids = self
            .by_order
            .get(&order)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.transactions.get(&id).map(|e| e.value().clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<Transaction> {
        self.collect(|_| true)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn collect(&self, filter: impl Fn(&Transaction) -> bool) -> Vec<Transaction> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by_key(|tx| tx.id);
        matching
    }

    fn append(&self, tx: Transaction) {
        if let Some(order) = tx.order_id {
            self.by_order.entry(order).or_default().push(tx.id);
        }
        self.transactions.insert(tx.id, tx);
    }

    fn allocate_id(&self) -> TransactionId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}
