//! Error types for the ledger engine
//!
//! This module defines every error that can occur while recording balances,
//! moving value between funds, or settling orders.
//!
//! # Error Categories
//!
//! - **Settlement Errors**: Insufficient funds, missing conversion paths, unknown
//!   funds or ledgers, invalid requests. These are recorded on a terminal
//!   transaction by the engine and never abort the caller.
//! - **Registry Errors**: Unknown or duplicate tokens, currencies and ledgers.
//! - **State Machine Errors**: Illegal transaction or order status transitions.
//! - **Storage Errors**: Lock poisoning. This is the only fatal category; nothing
//!   is persisted when it occurs.
//! - **Harness Errors**: Configuration, CSV parsing and file I/O.

use rust_decimal::Decimal;
use thiserror::Error;

use super::fund::{FundId, WalletId};
use super::order::{ListingId, OrderId};
use super::token::{CurrencyId, LedgerId, TokenId};
use super::transaction::{FailureReason, TransactionId, TransactionStatus};

/// Main error type for the ledger engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// The source fund cannot cover `amount + fee`
    #[error("Insufficient funds in fund {fund}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Fund that would have been debited
        fund: FundId,
        /// Balance at the time of the attempt
        available: Decimal,
        /// Requested debit
        requested: Decimal,
    },

    /// No directed conversion record exists for the token pair
    #[error("No conversion path from token {from} to token {to}")]
    NoConversionPath { from: TokenId, to: TokenId },

    /// Fund does not exist (or is retired)
    #[error("Fund {fund} not found")]
    FundNotFound { fund: FundId },

    /// Ledger does not exist
    #[error("Ledger {ledger} not found")]
    LedgerNotFound { ledger: LedgerId },

    /// A fund for this (wallet, token) pair already exists
    #[error("Fund for wallet {wallet} and token {token} already exists")]
    DuplicateFundConstraint { wallet: WalletId, token: TokenId },

    /// Request failed static validation (non-positive amount, self-transfer, ...)
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Token {token} not found")]
    TokenNotFound { token: String },

    #[error("Currency {currency} not found")]
    CurrencyNotFound { currency: CurrencyId },

    #[error("Listing {listing} not found")]
    ListingNotFound { listing: ListingId },

    #[error("Order {order} not found")]
    OrderNotFound { order: OrderId },

    #[error("Transaction {tx} not found")]
    TransactionNotFound { tx: TransactionId },

    /// A unique key (ledger name, token symbol, currency code) is already taken
    #[error("Duplicate {kind} '{key}'")]
    DuplicateEntry { kind: String, key: String },

    /// Checked decimal arithmetic overflowed
    #[error("Arithmetic overflow in {operation} on fund {fund}")]
    ArithmeticOverflow { operation: String, fund: FundId },

    /// A terminal transaction was asked to change status
    #[error("Transaction {tx} is already {status:?} and cannot move to {requested:?}")]
    TerminalStatus {
        tx: TransactionId,
        status: TransactionStatus,
        requested: TransactionStatus,
    },

    #[error("Order {order} cannot move from {from} to {to}")]
    InvalidOrderTransition {
        order: OrderId,
        from: String,
        to: String,
    },

    /// The order already has a successful or in-flight transaction
    #[error("Order {order} already has transaction {tx} in status {status:?}")]
    OrderInFlight {
        order: OrderId,
        tx: TransactionId,
        status: TransactionStatus,
    },

    /// Recomputed totals disagree with what was actually debited
    #[error("Integrity violation on transaction {tx}: {message}")]
    IntegrityViolation { tx: TransactionId, message: String },

    /// A compensating step could not be applied to a locked fund
    #[error("Rollback failed on fund {fund}: {message}")]
    RollbackFailed { fund: FundId, message: String },

    #[error("Fund {fund} still holds {balance} and cannot be retired")]
    FundNotEmpty { fund: FundId, balance: Decimal },

    /// A lock could not be acquired (poisoned by a crashed writer)
    ///
    /// This is the only fatal error: the operation aborts without producing any record.
    #[error("Storage unavailable: {resource}")]
    StorageUnavailable { resource: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },

    #[error("CSV parse error{}: {message}", line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    ParseError { line: Option<u64>, message: String },
}

impl From<std::io::Error> for LedgerError {
    fn from(error: std::io::Error) -> Self {
        LedgerError::IoError {
            message: error.to_string(),
        }
    }
}

impl From<csv::Error> for LedgerError {
    fn from(error: csv::Error) -> Self {
        let line = error.position().map(|pos| pos.line());

        LedgerError::ParseError {
            line,
            message: error.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for LedgerError {
    fn from(error: serde_yaml::Error) -> Self {
        LedgerError::Config {
            message: error.to_string(),
        }
    }
}

// Helper functions for creating common errors

impl LedgerError {
    pub fn insufficient_funds(fund: FundId, available: Decimal, requested: Decimal) -> Self {
        LedgerError::InsufficientFunds {
            fund,
            available,
            requested,
        }
    }

    pub fn no_conversion_path(from: TokenId, to: TokenId) -> Self {
        LedgerError::NoConversionPath { from, to }
    }

    pub fn fund_not_found(fund: FundId) -> Self {
        LedgerError::FundNotFound { fund }
    }

    pub fn ledger_not_found(ledger: LedgerId) -> Self {
        LedgerError::LedgerNotFound { ledger }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        LedgerError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn token_not_found(token: impl ToString) -> Self {
        LedgerError::TokenNotFound {
            token: token.to_string(),
        }
    }

    pub fn duplicate(kind: &str, key: impl ToString) -> Self {
        LedgerError::DuplicateEntry {
            kind: kind.to_string(),
            key: key.to_string(),
        }
    }

    pub fn arithmetic_overflow(operation: &str, fund: FundId) -> Self {
        LedgerError::ArithmeticOverflow {
            operation: operation.to_string(),
            fund,
        }
    }

    pub fn storage_unavailable(resource: impl Into<String>) -> Self {
        LedgerError::StorageUnavailable {
            resource: resource.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        LedgerError::Config {
            message: message.into(),
        }
    }

    /// Whether the error aborts an operation without any record being written
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::StorageUnavailable { .. } | LedgerError::RollbackFailed { .. }
        )
    }

    /// The reason stored on a terminal transaction for this error
    ///
    /// Returns `None` for errors that are not settlement outcomes (storage
    /// failures, state machine misuse, harness errors). Those propagate to
    /// the caller instead of being recorded.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            LedgerError::InsufficientFunds { .. } => Some(FailureReason::InsufficientFunds),
            LedgerError::NoConversionPath { .. } => Some(FailureReason::NoConversionPath),
            LedgerError::FundNotFound { .. } => Some(FailureReason::FundNotFound),
            LedgerError::LedgerNotFound { .. } => Some(FailureReason::LedgerNotFound),
            LedgerError::ArithmeticOverflow { .. } => Some(FailureReason::ArithmeticOverflow),
            LedgerError::IntegrityViolation { .. } => Some(FailureReason::IntegrityViolation),
            LedgerError::InvalidRequest { reason } => {
                Some(FailureReason::InvalidRequest(reason.clone()))
            }
            LedgerError::TokenNotFound { token } => Some(FailureReason::InvalidRequest(format!(
                "token {} not found",
                token
            ))),
            LedgerError::CurrencyNotFound { currency } => Some(FailureReason::InvalidRequest(
                format!("currency {} not found", currency),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal::Decimal;

    #[rstest]
    #[case::insufficient_funds(
        LedgerError::InsufficientFunds { fund: 1, available: Decimal::new(100000, 4), requested: Decimal::new(320000, 4) },
        "Insufficient funds in fund 1: available 10.0000, requested 32.0000"
    )]
    #[case::no_conversion_path(
        LedgerError::NoConversionPath { from: 1, to: 2 },
        "No conversion path from token 1 to token 2"
    )]
    #[case::duplicate_fund(
        LedgerError::DuplicateFundConstraint { wallet: 7, token: 1 },
        "Fund for wallet 7 and token 1 already exists"
    )]
    #[case::parse_error_with_line(
        LedgerError::ParseError { line: Some(42), message: "Invalid field".to_string() },
        "CSV parse error at line 42: Invalid field"
    )]
    #[case::parse_error_without_line(
        LedgerError::ParseError { line: None, message: "Invalid field".to_string() },
        "CSV parse error: Invalid field"
    )]
    #[case::storage(
        LedgerError::StorageUnavailable { resource: "fund 3".to_string() },
        "Storage unavailable: fund 3"
    )]
    #[case::rollback(
        LedgerError::RollbackFailed { fund: 4, message: "balance moved".to_string() },
        "Rollback failed on fund 4: balance moved"
    )]
    fn test_error_display(#[case] error: LedgerError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    #[case::insufficient(LedgerError::insufficient_funds(1, Decimal::ZERO, Decimal::ONE), Some(FailureReason::InsufficientFunds))]
    #[case::conversion(LedgerError::no_conversion_path(1, 2), Some(FailureReason::NoConversionPath))]
    #[case::fund(LedgerError::fund_not_found(9), Some(FailureReason::FundNotFound))]
    #[case::ledger(LedgerError::ledger_not_found(9), Some(FailureReason::LedgerNotFound))]
    #[case::invalid(LedgerError::invalid_request("self-transfer"), Some(FailureReason::InvalidRequest("self-transfer".to_string())))]
    #[case::storage(LedgerError::storage_unavailable("fund 1"), None)]
    #[case::config(LedgerError::config("bad"), None)]
    #[case::rollback(LedgerError::RollbackFailed { fund: 4, message: String::new() }, None)]
    fn test_failure_reason_mapping(
        #[case] error: LedgerError,
        #[case] expected: Option<FailureReason>,
    ) {
        assert_eq!(error.failure_reason(), expected);
    }

    #[test]
    fn test_only_storage_and_rollback_errors_are_fatal() {
        assert!(LedgerError::storage_unavailable("fund 1").is_fatal());
        assert!(LedgerError::RollbackFailed { fund: 1, message: String::new() }.is_fatal());
        assert!(!LedgerError::fund_not_found(1).is_fatal());
        assert!(!LedgerError::insufficient_funds(1, Decimal::ZERO, Decimal::ONE).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Permission denied");
        let error: LedgerError = io_error.into();
        assert!(matches!(error, LedgerError::IoError { .. }));
        assert_eq!(error.to_string(), "I/O error: Permission denied");
    }
}
