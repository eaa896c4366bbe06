//! Read-only reporting over one ledger's tokens and transactions

use std::sync::Arc;

use rust_decimal::Decimal;

use super::registry::TokenRegistry;
use super::transaction_store::TransactionStore;
use crate::types::{Ledger, LedgerError, LedgerId, Token, Transaction, TransactionStatus};

/// Totals over a ledger's journal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSummary {
    pub transactions: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,

    /// Sum of `amount` over successful transactions, in their source tokens
    pub settled_volume: Decimal,

    /// Fees credited to toll funds
    pub fees_collected: Decimal,

    /// Fees that left supply
    pub fees_burned: Decimal,
}

#[derive(Debug, Clone)]
pub struct LedgerBook {
    registry: Arc<TokenRegistry>,
    journal: Arc<TransactionStore>,
}

impl LedgerBook {
    pub fn new(registry: Arc<TokenRegistry>, journal: Arc<TransactionStore>) -> Self {
        Self { registry, journal }
    }

    pub fn find_ledger(&self, id: LedgerId) -> Result<Ledger, LedgerError> {
        self.registry.find_ledger(id)
    }

    pub fn tokens_of(&self, id: LedgerId) -> Result<Vec<Token>, LedgerError> {
        self.registry.find_ledger(id)?;
        Ok(self.registry.tokens_of(id))
    }

    pub fn transactions_of(&self, id: LedgerId) -> Result<Vec<Transaction>, LedgerError> {
        self.registry.find_ledger(id)?;
        Ok(self.journal.of_ledger(id))
    }

    /// Count outcomes and sum settled value for a ledger
    ///
    /// Rejected requests that named an unknown ledger are never attributed to
    /// an existing one, so they do not show up in any summary.
    pub fn summary(&self, id: LedgerId) -> Result<LedgerSummary, LedgerError> {
        let mut summary = LedgerSummary::default();

        for tx in self.transactions_of(id)? {
            summary.transactions += 1;
            match tx.status {
                TransactionStatus::Success => {
                    summary.succeeded += 1;
                    summary.settled_volume += tx.amount;
                    if tx.burned_fee() {
                        summary.fees_burned += tx.fee;
                    } else {
                        summary.fees_collected += tx.fee;
                    }
                }
                TransactionStatus::Failed => summary.failed += 1,
                TransactionStatus::Rejected => summary.rejected += 1,
                _ => {}
            }
        }
        Ok(summary)
    }
}
