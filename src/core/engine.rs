//! Transaction engine
//!
//! This module provides the `TransactionEngine`, which validates a value
//! movement and applies it atomically across up to three funds.
//!
//! # Settlement Phases
//!
//! 1. **Plan**: validate the request against the registry, fund store and
//!    conversion resolver. Nothing is locked or written yet.
//! 2. **Lock**: acquire every touched fund in ascending id order.
//! 3. **Record**: append a `Pending` journal record (`Recorded`).
//! 4. **Debit**: take `amount + fee` from the source (`Debited`).
//! 5. **Credit**: pay the destination its converted amount and the toll fund
//!    its fee (`Credited`).
//! 6. **Finalize**: verify the recomputed total against the debit, move token
//!    supplies, resolve `Success`.
//!
//! Any failure after the record step rolls back every applied balance step
//! and resolves the record `Failed`. Failures during planning leave a
//! `Rejected` (or `Failed`) record without touching a balance. The record is
//! resolved before the fund locks are released. Only `StorageUnavailable` and
//! `RollbackFailed` are returned to the caller instead of recorded.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::conversion::ConversionResolver;
use super::fund_store::{FundStore, UnitOfWork};
use super::registry::TokenRegistry;
use super::transaction_store::TransactionStore;
use crate::config::{EngineConfig, FeePolicy, RecoveryPolicy};
use crate::types::{
    FailureReason, Fee, Fund, FundId, LedgerError, SettlementStage, Token, TokenId, Transaction,
    TransactionId, TransactionRequest, TransactionStatus, TransactionType,
};

/// Outcome of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted transactions finished as `Success`
    pub completed: Vec<TransactionId>,
    /// Interrupted transactions whose debit was returned (`Failed`)
    pub reversed: Vec<TransactionId>,
    /// Transactions that never moved a balance (`Expired`)
    pub expired: Vec<TransactionId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.reversed.is_empty() && self.expired.is_empty()
    }
}

/// Everything settlement needs, resolved before any lock is taken
#[derive(Debug)]
struct Plan {
    from: Fund,
    to: Fund,
    toll: Option<FundId>,
    source: Token,
    credited: Decimal,
}

impl Plan {
    fn fund_ids(&self) -> Vec<FundId> {
        let mut ids = vec![self.from.id, self.to.id];
        ids.extend(self.toll);
        ids
    }
}

/// Thread-safe settlement engine
///
/// Every method takes `&self`; callers share the engine through an `Arc` and
/// call it from as many threads as they like.
#[derive(Debug)]
pub struct TransactionEngine {
    registry: Arc<TokenRegistry>,
    funds: Arc<FundStore>,
    conversions: Arc<ConversionResolver>,
    journal: Arc<TransactionStore>,
    config: EngineConfig,

    /// Original transaction -> its successful refund
    refunds: DashMap<TransactionId, TransactionId>,
}

impl TransactionEngine {
    pub fn new(
        registry: Arc<TokenRegistry>,
        funds: Arc<FundStore>,
        conversions: Arc<ConversionResolver>,
        journal: Arc<TransactionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            funds,
            conversions,
            journal,
            config,
            refunds: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    pub fn funds(&self) -> &Arc<FundStore> {
        &self.funds
    }

    pub fn conversions(&self) -> &Arc<ConversionResolver> {
        &self.conversions
    }

    pub fn journal(&self) -> &Arc<TransactionStore> {
        &self.journal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Settle a transaction request
    ///
    /// # Arguments
    ///
    /// * `request` - Source and destination funds, amount in the source token,
    ///   fee, currency and ledger
    ///
    /// # Returns
    ///
    /// The journal record of this attempt. Its status is `Success`, `Failed`
    /// (insufficient funds, missing conversion, overflow, integrity) or
    /// `Rejected` (unknown fund or ledger, invalid request). A non-success
    /// record never comes with a balance change.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if a fund lock is poisoned. In that case
    /// nothing is recorded and no balance changes.
    pub fn submit(&self, request: TransactionRequest) -> Result<Transaction, LedgerError> {
        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(err) => return self.reject(&request, err),
        };

        let handles = match self.funds.handles(&plan.fund_ids()) {
            Ok(handles) => handles,
            Err(err) => return self.reject(&request, err),
        };
        let mut unit = UnitOfWork::acquire(&handles)?;

        // A fund may have been retired between planning and locking
        for id in plan.fund_ids() {
            if unit.fund(id)?.retired {
                drop(unit);
                return self.reject(&request, LedgerError::fund_not_found(id));
            }
        }

        let tx = self.journal.open(&request, plan.credited);

        match self.settle(&mut unit, &tx) {
            Ok(done) => {
                unit.commit();
                info!(
                    tx = done.id,
                    from = done.from_fund_id,
                    to = done.to_fund_id,
                    amount = %done.amount,
                    fee = %done.fee,
                    token = %plan.source.symbol,
                    "transaction settled"
                );
                Ok(done)
            }
            Err(err) => {
                if let Err(rollback_err) = unit.rollback() {
                    error!(tx = tx.id, error = %rollback_err, "rollback failed");
                    return Err(rollback_err);
                }
                // Resolve while the funds are still locked, so recovery never
                // sees a rolled-back record as pending
                let failed = self.fail(tx.id, err);
                drop(unit);
                failed
            }
        }
    }

    /// Validate a request and resolve every value settlement needs
    fn plan(&self, request: &TransactionRequest) -> Result<Plan, LedgerError> {
        request.validate()?;
        self.registry.find_ledger(request.ledger_id)?;

        let from = self.active_fund(request.from_fund_id)?;
        let to = self.active_fund(request.to_fund_id)?;
        let source = self.registry.find_token(from.token_id)?;

        if source.ledger_id != request.ledger_id {
            return Err(LedgerError::invalid_request(format!(
                "token {} is not issued on ledger {}",
                source.symbol, request.ledger_id
            )));
        }
        if source.currency_id != request.currency_id {
            return Err(LedgerError::invalid_request(format!(
                "currency {} does not match token {}",
                request.currency_id, source.symbol
            )));
        }
        let fee = request.fee.amount();
        if !source.fits_precision(request.amount) || !source.fits_precision(fee) {
            return Err(LedgerError::invalid_request(format!(
                "amount exceeds {} decimals of token {}",
                source.decimals, source.symbol
            )));
        }
        request.total()?;

        let toll = match request.fee {
            Fee::None => None,
            Fee::Burn { .. } => {
                if self.config.fee_policy == FeePolicy::RequireToll {
                    return Err(LedgerError::invalid_request(
                        "fee without a toll fund is not allowed",
                    ));
                }
                None
            }
            Fee::Toll { fund_id, .. } => {
                let toll = self.active_fund(fund_id)?;
                if toll.token_id != source.id {
                    return Err(LedgerError::invalid_request(format!(
                        "toll fund {} does not hold token {}",
                        fund_id, source.symbol
                    )));
                }
                Some(fund_id)
            }
        };

        let credited = self
            .conversions
            .convert(request.amount, from.token_id, to.token_id)?;
        if credited.is_zero() {
            return Err(LedgerError::invalid_request(format!(
                "{} {} converts to zero",
                request.amount, source.symbol
            )));
        }

        Ok(Plan {
            from,
            to,
            toll,
            source,
            credited,
        })
    }

    fn active_fund(&self, id: FundId) -> Result<Fund, LedgerError> {
        let fund = self.funds.get(id)?;
        if fund.retired {
            return Err(LedgerError::fund_not_found(id));
        }
        Ok(fund)
    }

    fn settle(
        &self,
        unit: &mut UnitOfWork<'_>,
        tx: &Transaction,
    ) -> Result<Transaction, LedgerError> {
        self.apply_debit(unit, tx)?;
        self.apply_credits(unit, tx)?;
        let debited = unit.debited();
        self.finalize(unit, tx, debited)
    }

    fn apply_debit(&self, unit: &mut UnitOfWork<'_>, tx: &Transaction) -> Result<(), LedgerError> {
        unit.debit(tx.from_fund_id, tx.total_amount)?;
        self.journal.advance(tx.id, SettlementStage::Debited)
    }

    fn apply_credits(&self, unit: &mut UnitOfWork<'_>, tx: &Transaction) -> Result<(), LedgerError> {
        unit.credit(tx.to_fund_id, tx.credited_amount)?;
        if let Some(toll) = tx.toll_fund_id {
            unit.credit(toll, tx.fee)?;
        }
        self.journal.advance(tx.id, SettlementStage::Credited)
    }

    /// Verify totals, move supplies and resolve `Success`
    fn finalize(
        &self,
        unit: &UnitOfWork<'_>,
        tx: &Transaction,
        debited: Decimal,
    ) -> Result<Transaction, LedgerError> {
        tx.verify_total(debited)?;

        let source = unit.fund(tx.from_fund_id)?.token_id;
        let destination = unit.fund(tx.to_fund_id)?.token_id;

        let mut deltas: Vec<(TokenId, Decimal)> = Vec::new();
        if source != destination {
            deltas.push((source, -tx.amount));
            deltas.push((destination, tx.credited_amount));
        }
        if tx.burned_fee() {
            deltas.push((source, -tx.fee));
        }
        self.apply_supply(&deltas)?;

        match self.journal.resolve(tx.id, TransactionStatus::Success, None) {
            Ok(done) => Ok(done),
            Err(err) => {
                self.revert_supply(&deltas);
                Err(err)
            }
        }
    }

    fn apply_supply(&self, deltas: &[(TokenId, Decimal)]) -> Result<(), LedgerError> {
        for (applied, (token, delta)) in deltas.iter().enumerate() {
            if let Err(err) = self.registry.adjust_supply(*token, *delta) {
                self.revert_supply(&deltas[..applied]);
                return Err(err);
            }
        }
        Ok(())
    }

    fn revert_supply(&self, deltas: &[(TokenId, Decimal)]) {
        for (token, delta) in deltas.iter().rev() {
            if let Err(err) = self.registry.adjust_supply(*token, -*delta) {
                error!(token, error = %err, "supply revert failed");
            }
        }
    }

    /// Record a request that failed before its atomic phase
    ///
    /// Errors without a failure reason (storage, state machine misuse) are
    /// returned instead of recorded.
    pub(crate) fn reject(
        &self,
        request: &TransactionRequest,
        err: LedgerError,
    ) -> Result<Transaction, LedgerError> {
        match err.failure_reason() {
            Some(reason) => {
                let tx = self.journal.record_rejected(request, reason);
                warn!(
                    tx = tx.id,
                    from = request.from_fund_id,
                    to = request.to_fund_id,
                    status = tx.status.as_str(),
                    reason = %err,
                    "transaction not settled"
                );
                Ok(tx)
            }
            None => Err(err),
        }
    }

    /// Resolve an opened record after its balance steps were rolled back
    fn fail(&self, id: TransactionId, err: LedgerError) -> Result<Transaction, LedgerError> {
        let reason = match err.failure_reason() {
            Some(reason) => reason,
            None => return Err(err),
        };
        let tx = self.journal.resolve(id, reason.status(), Some(reason))?;
        warn!(tx = id, status = tx.status.as_str(), reason = %err, "transaction rolled back");
        Ok(tx)
    }

    /// Credit a fund from outside the ledger, minting supply
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a non-positive amount or one finer than the
    /// token's precision, `FundNotFound` for an unknown or retired fund.
    pub fn deposit(&self, fund_id: FundId, amount: Decimal) -> Result<Fund, LedgerError> {
        self.external_flow(fund_id, amount, TransactionType::Deposit)
    }

    /// Debit a fund to outside the ledger, burning supply
    ///
    /// # Errors
    ///
    /// Same as `deposit`, plus `InsufficientFunds` when the balance is too low.
    pub fn withdraw(&self, fund_id: FundId, amount: Decimal) -> Result<Fund, LedgerError> {
        self.external_flow(fund_id, amount, TransactionType::Withdraw)
    }

    fn external_flow(
        &self,
        fund_id: FundId,
        amount: Decimal,
        kind: TransactionType,
    ) -> Result<Fund, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_request(format!(
                "{} amount must be positive, got {}",
                kind.as_str(),
                amount
            )));
        }
        let fund = self.active_fund(fund_id)?;
        let token = self.registry.find_token(fund.token_id)?;
        if !token.fits_precision(amount) {
            return Err(LedgerError::invalid_request(format!(
                "amount {} exceeds {} decimals of token {}",
                amount, token.decimals, token.symbol
            )));
        }

        let handles = self.funds.handles(&[fund_id])?;
        let mut unit = UnitOfWork::acquire(&handles)?;
        let delta = match kind {
            TransactionType::Withdraw => {
                unit.debit(fund_id, amount)?;
                -amount
            }
            _ => {
                unit.credit(fund_id, amount)?;
                amount
            }
        };
        if let Err(err) = self.registry.adjust_supply(token.id, delta) {
            unit.rollback()?;
            return Err(err);
        }

        let updated = unit.fund(fund_id)?.clone();
        unit.commit();
        debug!(fund = fund_id, %amount, kind = kind.as_str(), "external flow applied");
        Ok(updated)
    }

    /// Reverse a successful transaction
    ///
    /// Moves the original's credited amount from its destination back to its
    /// source as a new `Refund` transaction. When the tokens differ the amount
    /// converts back through the reverse conversion record. Fees are not
    /// refunded and the original keeps its status.
    ///
    /// # Returns
    ///
    /// The refund's journal record. A failed refund (for example because the
    /// destination already spent the funds) can be retried.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotFound` for an unknown id and `InvalidRequest` if
    /// the original did not succeed, is itself a refund, or was already refunded.
    pub fn refund(&self, tx_id: TransactionId) -> Result<Transaction, LedgerError> {
        let original = self.journal.get(tx_id)?;
        if original.status != TransactionStatus::Success {
            return Err(LedgerError::invalid_request(format!(
                "transaction {} is {} and cannot be refunded",
                tx_id,
                original.status.as_str()
            )));
        }
        if original.tx_type == TransactionType::Refund {
            return Err(LedgerError::invalid_request(format!(
                "transaction {} is a refund and cannot be refunded",
                tx_id
            )));
        }

        let destination = self.funds.get(original.to_fund_id)?;
        let token = self.registry.find_token(destination.token_id)?;
        let mut request = TransactionRequest::new(
            original.to_fund_id,
            original.from_fund_id,
            original.credited_amount,
            token.currency_id,
            token.ledger_id,
        )
        .with_type(TransactionType::Refund);
        request.refund_of = Some(tx_id);

        // The slot stays locked until the refund resolves, so two concurrent
        // refunds of one transaction cannot both succeed
        match self.refunds.entry(tx_id) {
            Entry::Occupied(claimed) => Err(LedgerError::invalid_request(format!(
                "transaction {} was already refunded by {}",
                tx_id,
                claimed.get()
            ))),
            Entry::Vacant(slot) => {
                let refund = self.submit(request)?;
                if refund.status == TransactionStatus::Success {
                    slot.insert(refund.id);
                    info!(tx = refund.id, refund_of = tx_id, "transaction refunded");
                }
                Ok(refund)
            }
        }
    }

    /// Finish every transaction a crash left `Pending`
    ///
    /// - `Recorded`: nothing moved, the record expires.
    /// - `Debited`: credits are completed (roll forward) or the debit is
    ///   returned to the source (reverse), depending on the recovery policy.
    /// - `Credited`: supplies are moved and the record succeeds.
    ///
    /// Each record is re-read once its funds are locked, so a transaction a
    /// live `submit` resolved in the meantime is left alone. The debit of an
    /// interrupted transaction is known only from its `Debited` stage, so
    /// finalizing checks `amount + fee` against the recorded total rather
    /// than against a debit observed in this pass.
    ///
    /// Fund locks poisoned by the crash are adopted and cleared.
    ///
    /// # Errors
    ///
    /// Returns the first error that prevents a pending record from being
    /// resolved. The balance steps applied for that record are rolled back
    /// and it stays `Pending`. Records resolved before it stay resolved.
    pub fn recover(&self) -> Result<RecoveryReport, LedgerError> {
        let mut report = RecoveryReport::default();

        for pending in self.journal.pending() {
            let mut ids = vec![pending.from_fund_id, pending.to_fund_id];
            ids.extend(pending.toll_fund_id);
            let handles = self.funds.handles(&ids)?;
            let mut unit = UnitOfWork::acquire_recovering(&handles);

            let tx = self.journal.get(pending.id)?;
            if tx.status != TransactionStatus::Pending {
                debug!(tx = tx.id, status = tx.status.as_str(), "resolved before recovery");
                continue;
            }

            if let Err(err) = self.recover_one(&mut unit, &tx, &mut report) {
                unit.rollback()?;
                error!(tx = tx.id, error = %err, "recovery failed");
                return Err(err);
            }
            unit.commit();
        }

        if !report.is_empty() {
            info!(
                completed = report.completed.len(),
                reversed = report.reversed.len(),
                expired = report.expired.len(),
                "recovery finished"
            );
        }
        Ok(report)
    }

    /// Finish one pending record under its fund locks
    ///
    /// Balance steps go through `unit` and the stage is not advanced, so a
    /// failure can be rolled back to exactly the state the crash left.
    fn recover_one(
        &self,
        unit: &mut UnitOfWork<'_>,
        tx: &Transaction,
        report: &mut RecoveryReport,
    ) -> Result<(), LedgerError> {
        let recorded_debit = tx.total_amount;

        match tx.stage {
            SettlementStage::Recorded => {
                self.journal
                    .resolve(tx.id, TransactionStatus::Expired, None)?;
                report.expired.push(tx.id);
            }
            SettlementStage::Debited => match self.config.recovery {
                RecoveryPolicy::RollForward => {
                    unit.credit(tx.to_fund_id, tx.credited_amount)?;
                    if let Some(toll) = tx.toll_fund_id {
                        unit.credit(toll, tx.fee)?;
                    }
                    self.finalize(unit, tx, recorded_debit)?;
                    report.completed.push(tx.id);
                }
                RecoveryPolicy::Reverse => {
                    unit.credit(tx.from_fund_id, recorded_debit)?;
                    self.journal.resolve(
                        tx.id,
                        TransactionStatus::Failed,
                        Some(FailureReason::Interrupted),
                    )?;
                    report.reversed.push(tx.id);
                }
            },
            SettlementStage::Credited => {
                self.finalize(unit, tx, recorded_debit)?;
                report.completed.push(tx.id);
            }
        }
        Ok(())
    }
}
