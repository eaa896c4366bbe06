//! Transaction-related types for the ledger engine
//!
//! This module defines the request the engine accepts, the immutable record it
//! appends for every attempt, and the status state machine those records follow.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::LedgerError;
use super::fund::FundId;
use super::order::OrderId;
use super::token::{CurrencyId, LedgerId};

/// Transaction identifier
pub type TransactionId = u64;

/// Business meaning of a value movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    /// Settlement of an order
    Purchase,
    /// Reversal of an earlier successful transaction
    Refund,
    /// Swap between two tokens
    Exchange,
    Tip,
    Deposit,
    Withdraw,
    Credit,
    Debit,
    /// Plain transfer between two wallets
    Payment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Exchange => "exchange",
            TransactionType::Tip => "tip",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
            TransactionType::Payment => "payment",
        }
    }
}

/// Lifecycle status of a transaction
///
/// Every transaction starts `Pending` and is resolved to exactly one terminal
/// status. Terminal statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Rejected,
    Expired,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::Expired => "EXPIRED",
        }
    }
}

/// Why a transaction did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    InsufficientFunds,
    NoConversionPath,
    FundNotFound,
    LedgerNotFound,
    InvalidRequest(String),
    ArithmeticOverflow,
    IntegrityViolation,
    /// The process stopped between debit and credit and recovery reversed the debit
    Interrupted,
}

impl FailureReason {
    /// Terminal status a transaction takes when it fails for this reason
    ///
    /// Requests that could never have succeeded (unknown funds or ledgers,
    /// malformed input) are `Rejected`. Everything else is `Failed`.
    pub fn status(&self) -> TransactionStatus {
        match self {
            FailureReason::FundNotFound
            | FailureReason::LedgerNotFound
            | FailureReason::InvalidRequest(_) => TransactionStatus::Rejected,
            _ => TransactionStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::NoConversionPath => "no_conversion_path",
            FailureReason::FundNotFound => "fund_not_found",
            FailureReason::LedgerNotFound => "ledger_not_found",
            FailureReason::InvalidRequest(_) => "invalid_request",
            FailureReason::ArithmeticOverflow => "arithmetic_overflow",
            FailureReason::IntegrityViolation => "integrity_violation",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

/// Fee charged on top of a transfer
///
/// A fee is always paid from the source fund in the source token. It is either
/// credited to a toll fund or burned out of supply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fee {
    None,
    Toll { fund_id: FundId, amount: Decimal },
    Burn { amount: Decimal },
}

impl Fee {
    pub fn amount(&self) -> Decimal {
        match self {
            Fee::None => Decimal::ZERO,
            Fee::Toll { amount, .. } | Fee::Burn { amount } => *amount,
        }
    }

    pub fn toll_fund(&self) -> Option<FundId> {
        match self {
            Fee::Toll { fund_id, .. } => Some(*fund_id),
            _ => None,
        }
    }
}

/// Request to move value from one fund to another
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub from_fund_id: FundId,
    pub to_fund_id: FundId,
    pub fee: Fee,

    /// Amount debited from the source, denominated in the source token
    pub amount: Decimal,

    /// Must match the source token's currency
    pub currency_id: CurrencyId,

    pub ledger_id: LedgerId,
    pub order_id: Option<OrderId>,
    pub tx_type: TransactionType,

    /// Transaction this request reverses, for refunds
    pub refund_of: Option<TransactionId>,
}

impl TransactionRequest {
    /// Build a fee-less payment between two funds
    pub fn new(
        from_fund_id: FundId,
        to_fund_id: FundId,
        amount: Decimal,
        currency_id: CurrencyId,
        ledger_id: LedgerId,
    ) -> Self {
        TransactionRequest {
            from_fund_id,
            to_fund_id,
            fee: Fee::None,
            amount,
            currency_id,
            ledger_id,
            order_id: None,
            tx_type: TransactionType::Payment,
            refund_of: None,
        }
    }

    pub fn with_fee(mut self, fee: Fee) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_type(mut self, tx_type: TransactionType) -> Self {
        self.tx_type = tx_type;
        self
    }

    pub fn for_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self.tx_type = TransactionType::Purchase;
        self
    }

    /// `amount + fee`, the debit this request asks of its source
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` when the sum does not fit a `Decimal`.
    pub fn total(&self) -> Result<Decimal, LedgerError> {
        self.amount
            .checked_add(self.fee.amount())
            .ok_or_else(|| LedgerError::arithmetic_overflow("total", self.from_fund_id))
    }

    /// Check the request's shape without touching any store
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the source and destination are the same
    /// fund, the amount is not positive, the fee is negative, or the toll fund
    /// is one of the two endpoints.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.from_fund_id == self.to_fund_id {
            return Err(LedgerError::invalid_request(
                "source and destination fund are the same",
            ));
        }
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_request(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.fee.amount() < Decimal::ZERO {
            return Err(LedgerError::invalid_request(format!(
                "fee must not be negative, got {}",
                self.fee.amount()
            )));
        }
        if let Some(toll) = self.fee.toll_fund() {
            if toll == self.from_fund_id || toll == self.to_fund_id {
                return Err(LedgerError::invalid_request(
                    "toll fund must differ from source and destination",
                ));
            }
        }
        Ok(())
    }
}

/// Write-ahead settlement stage of a pending transaction
///
/// Recovery uses the stage to decide how to finish a transaction that was
/// interrupted before it reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SettlementStage {
    /// Intent recorded, no balance touched
    Recorded,
    /// Source debited by `total_amount`
    Debited,
    /// Destination and toll credited
    Credited,
}

/// Immutable record of one settlement attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_fund_id: FundId,
    pub to_fund_id: FundId,
    pub toll_fund_id: Option<FundId>,
    pub ledger_id: LedgerId,
    pub order_id: Option<OrderId>,
    pub currency_id: CurrencyId,
    pub amount: Decimal,
    pub fee: Decimal,

    /// `amount + fee`, recomputed by the engine and verified against the debit
    pub total_amount: Decimal,

    /// What the destination received, in the destination token
    pub credited_amount: Decimal,

    pub status: TransactionStatus,
    pub tx_type: TransactionType,
    pub failure: Option<FailureReason>,
    pub stage: SettlementStage,
    pub refund_of: Option<TransactionId>,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Create a pending record for a request
    ///
    /// `total_amount` is derived here, never taken from the caller. It
    /// saturates at `Decimal::MAX`; the engine refuses to settle a request
    /// whose total overflows, so only rejected records can carry a saturated
    /// total.
    pub fn pending(id: TransactionId, request: &TransactionRequest, credited_amount: Decimal) -> Self {
        Transaction {
            id,
            from_fund_id: request.from_fund_id,
            to_fund_id: request.to_fund_id,
            toll_fund_id: request.fee.toll_fund(),
            ledger_id: request.ledger_id,
            order_id: request.order_id,
            currency_id: request.currency_id,
            amount: request.amount,
            fee: request.fee.amount(),
            total_amount: request.amount.saturating_add(request.fee.amount()),
            credited_amount,
            status: TransactionStatus::Pending,
            tx_type: request.tx_type,
            failure: None,
            stage: SettlementStage::Recorded,
            refund_of: request.refund_of,
            timestamp: Utc::now(),
        }
    }

    /// Create a terminal record for a request that failed before anything was locked
    pub fn rejected(id: TransactionId, request: &TransactionRequest, reason: FailureReason) -> Self {
        let mut tx = Transaction::pending(id, request, Decimal::ZERO);
        tx.status = reason.status();
        tx.failure = Some(reason);
        tx
    }

    /// Whether the fee left supply instead of landing in a toll fund
    pub fn burned_fee(&self) -> bool {
        self.toll_fund_id.is_none() && self.fee > Decimal::ZERO
    }

    /// Compare the recomputed total with what was actually debited
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` when `amount + fee` differs from the stored
    /// total or from `debited`.
    pub fn verify_total(&self, debited: Decimal) -> Result<(), LedgerError> {
        let expected = self
            .amount
            .checked_add(self.fee)
            .ok_or_else(|| LedgerError::arithmetic_overflow("total", self.from_fund_id))?;

        if expected != self.total_amount || expected != debited {
            return Err(LedgerError::IntegrityViolation {
                tx: self.id,
                message: format!(
                    "amount {} + fee {} = {}, recorded {}, debited {}",
                    self.amount, self.fee, expected, self.total_amount, debited
                ),
            });
        }
        Ok(())
    }
}
