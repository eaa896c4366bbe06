//! Amber Ledger CLI
//!
//! ```bash
//! amber-ledger --catalog catalog.yaml operations.csv > balances.csv
//! amber-ledger --catalog catalog.yaml --strategy sync --journal journal.csv operations.csv
//! amber-ledger --catalog catalog.yaml --batch-size 2000 --max-concurrent 8 operations.csv
//! ```
//!
//! Final fund balances go to stdout, logs to stderr.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (bad catalog, unreadable input, output failure)

use std::fs::File;
use std::process;

use amber_ledger::types::LedgerError;
use amber_ledger::{cli, logging, strategy, LedgerConfig};
use tracing::error;

fn run(args: &cli::CliArgs) -> Result<(), LedgerError> {
    let config = LedgerConfig::from_file(&args.catalog)?;

    let strategy = {
        let batch = if matches!(args.strategy, cli::StrategyType::Async) {
            Some(args.to_batch_config())
        } else {
            None
        };
        strategy::create_strategy(args.strategy, batch)
    };

    let services = amber_ledger::replay(strategy.as_ref(), &args.input_file, &config)?;

    let mut output = std::io::stdout();
    amber_ledger::write_balances(&services, &mut output)?;

    if let Some(path) = &args.journal {
        let mut file = File::create(path)?;
        amber_ledger::write_transactions_csv(&services.journal().all(), &mut file)?;
    }
    Ok(())
}

fn main() {
    let args = cli::parse_args();
    logging::init_logging(&args.log_level);

    if let Err(e) = run(&args) {
        error!(error = %e, "ledger run failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
