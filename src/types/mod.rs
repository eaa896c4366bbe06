//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `token`: Tokens, currencies, ledgers and conversion records
//! - `fund`: Per-wallet token balances
//! - `transaction`: Transaction requests, records and status state machine
//! - `order`: Listings, orders and receipts
//! - `operation`: Replayable input operations
//! - `error`: Error types for the ledger engine

pub mod error;
pub mod fund;
pub mod operation;
pub mod order;
pub mod token;
pub mod transaction;

pub use error::LedgerError;
pub use fund::{Fund, FundId, WalletId};
pub use operation::{FundKey, LedgerOperation};
pub use order::{Listing, ListingId, Order, OrderId, OrderStatus, PortfolioId, Receipt};
pub use token::{
    Conversion, Currency, CurrencyId, Ledger, LedgerId, Token, TokenId, TokenKind,
    MAX_TOKEN_DECIMALS, MIN_TOKEN_DECIMALS,
};
pub use transaction::{
    FailureReason, Fee, SettlementStage, Transaction, TransactionId, TransactionRequest,
    TransactionStatus, TransactionType,
};
