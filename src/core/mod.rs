//! Core ledger components
//!
//! - `registry` - Ledgers, currencies and tokens
//! - `fund_store` - Per-(wallet, token) balances, fund locks and units of work
//! - `conversion` - Directed exchange rates between tokens
//! - `transaction_store` - Append-only transaction journal
//! - `engine` - Validation, atomic settlement, refunds and crash recovery
//! - `settlement` - Orders and their state machine
//! - `ledger` - Read-only reporting per ledger
//! - `traits` - Catalog lookups the settlement layer depends on

pub mod conversion;
pub mod engine;
pub mod fund_store;
pub mod ledger;
pub mod registry;
pub mod settlement;
pub mod traits;
pub mod transaction_store;

pub use conversion::ConversionResolver;
pub use engine::{RecoveryReport, TransactionEngine};
pub use fund_store::{FundHandle, FundStore, UnitOfWork};
pub use ledger::{LedgerBook, LedgerSummary};
pub use registry::{NewToken, TokenRegistry};
pub use settlement::OrderCoordinator;
pub use traits::{ListingSource, WalletDirectory};
pub use transaction_store::TransactionStore;
