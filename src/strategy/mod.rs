//! Processing strategies
//!
//! A strategy reads operations from a CSV file and applies them to a shared
//! `LedgerServices`. The synchronous strategy replays rows one by one; the
//! asynchronous one reads batches and runs fund-disjoint groups in parallel.
//! Both leave the ledger in the same final state for the same input.

use std::path::Path;
use std::sync::Arc;

use crate::cli::StrategyType;
use crate::services::LedgerServices;
use crate::types::LedgerError;

pub mod r#async;
pub mod batch_processor;
pub mod sync;

pub use self::r#async::{AsyncProcessingStrategy, BatchConfig};
pub use batch_processor::{BatchProcessor, ProcessingResult};
pub use sync::SyncProcessingStrategy;

pub trait ProcessingStrategy: Send + Sync {
    /// Apply every operation in `input_path` to `services`
    ///
    /// # Errors
    ///
    /// Returns an error only when processing cannot go on: the input cannot be
    /// opened or the async runtime cannot start. Rows that fail to decode or
    /// operations the ledger refuses are logged and skipped.
    fn process(&self, input_path: &Path, services: &Arc<LedgerServices>)
        -> Result<(), LedgerError>;
}

/// Create a processing strategy
///
/// `config` is only used by the async strategy and defaults when absent.
pub fn create_strategy(
    strategy_type: StrategyType,
    config: Option<BatchConfig>,
) -> Box<dyn ProcessingStrategy> {
    match strategy_type {
        StrategyType::Sync => Box::new(SyncProcessingStrategy),
        StrategyType::Async => Box::new(AsyncProcessingStrategy::new(config.unwrap_or_default())),
    }
}
