//! Amber Ledger
//!
//! A multi-token ledger and settlement engine. Value lives in funds, one per
//! (wallet, token). The transaction engine moves value between funds
//! atomically, converting between tokens at configured rates and charging
//! tolled or burned fees, and journals every attempt. Orders against listings
//! settle through the engine.
//!
//! # Architecture
//!
//! - [`types`] - Tokens, funds, transactions, orders and the error type
//! - [`core`] - Business logic:
//!   - [`core::registry`] - Ledgers, currencies and tokens
//!   - [`core::fund_store`] - Balances and ordered fund locking
//!   - [`core::conversion`] - Exchange rates
//!   - [`core::engine`] - Settlement, refunds and recovery
//!   - [`core::settlement`] - Orders
//!   - [`core::ledger`] - Per-ledger reporting
//! - [`config`] - YAML catalog and policies
//! - [`services`] - Builds the component graph and replays operations
//! - [`io`] - CSV input and output
//! - [`strategy`] - Sync and async replay pipelines
//! - [`cli`] - Command-line arguments
//!
//! # Invariants
//!
//! - A fund balance never goes negative
//! - A successful transaction moves exactly `amount + fee` out of its source
//! - Each token's supply moves by exactly the balance it gains or loses
//!   outside of plain transfers
//! - A transaction never leaves a terminal status

pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod logging;
pub mod services;
pub mod strategy;
pub mod types;

use std::path::Path;
use std::sync::Arc;

pub use config::LedgerConfig;
pub use core::{OrderCoordinator, TransactionEngine};
pub use io::{write_funds_csv, write_transactions_csv};
pub use services::{LedgerServices, Outcome};
pub use types::{LedgerError, LedgerOperation, Transaction, TransactionRequest};

use strategy::ProcessingStrategy;

/// Build services from `config` and replay `input` through `strategy`
pub fn replay(
    strategy: &dyn ProcessingStrategy,
    input: &Path,
    config: &LedgerConfig,
) -> Result<Arc<LedgerServices>, LedgerError> {
    let services = Arc::new(LedgerServices::from_config(config)?);
    strategy.process(input, &services)?;
    Ok(services)
}

/// Write final balances for every fund
pub fn write_balances(
    services: &LedgerServices,
    output: &mut dyn std::io::Write,
) -> Result<(), LedgerError> {
    let funds = services.funds().balances()?;
    write_funds_csv(&funds, &services.registry().tokens(), output)
}
