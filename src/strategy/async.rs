//! Asynchronous batch processing strategy
//!
//! ```text
//! AsyncProcessingStrategy
//!     ├── BatchConfig (batch_size, max_concurrent_batches)
//!     ├── AsyncReader (batch CSV reading)
//!     └── BatchProcessor (fund-disjoint groups, one tokio task each)
//!             └── Arc<LedgerServices>
//! ```
//!
//! Batches run one after another so an operation never overtakes an earlier
//! operation on the same fund across batch boundaries. Inside a batch, groups
//! run on the multi-threaded runtime's workers.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::io::async_reader::AsyncReader;
use crate::services::LedgerServices;
use crate::strategy::{BatchProcessor, ProcessingStrategy};
use crate::types::LedgerError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    /// Number of operations per batch
    pub batch_size: usize,
    /// Worker threads in the runtime
    pub max_concurrent_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent_batches: num_cpus::get(),
        }
    }
}

impl BatchConfig {
    /// Build a config, replacing zero values with defaults
    pub fn new(batch_size: usize, max_concurrent_batches: usize) -> Self {
        let default = Self::default();

        let batch_size = if batch_size == 0 {
            warn!(default = default.batch_size, "invalid batch_size 0, using default");
            default.batch_size
        } else {
            batch_size
        };

        let max_concurrent_batches = if max_concurrent_batches == 0 {
            warn!(
                default = default.max_concurrent_batches,
                "invalid max_concurrent_batches 0, using default"
            );
            default.max_concurrent_batches
        } else {
            max_concurrent_batches
        };

        Self {
            batch_size,
            max_concurrent_batches,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncProcessingStrategy {
    config: BatchConfig,
}

impl AsyncProcessingStrategy {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }
}

impl ProcessingStrategy for AsyncProcessingStrategy {
    /// Read batches and apply each one through the batch processor
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the runtime cannot be built or the input cannot
    /// be opened. Per-operation failures are logged, not returned.
    fn process(
        &self,
        input_path: &Path,
        services: &Arc<LedgerServices>,
    ) -> Result<(), LedgerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.max_concurrent_batches)
            .build()
            .map_err(|e| LedgerError::IoError {
                message: format!("Failed to create tokio runtime: {}", e),
            })?;

        runtime.block_on(async {
            let processor = BatchProcessor::new(Arc::clone(services));

            let file = tokio::fs::File::open(input_path)
                .await
                .map_err(|e| LedgerError::IoError {
                    message: format!("Failed to open file '{}': {}", input_path.display(), e),
                })?;
            let compat_file = tokio_util::compat::TokioAsyncReadCompatExt::compat(file);
            let mut reader = AsyncReader::new(compat_file);

            let (mut applied, mut refused) = (0usize, 0usize);
            loop {
                let batch = reader.read_batch(self.config.batch_size).await;
                if batch.is_empty() {
                    break;
                }

                for outcome in processor.process_batch(batch).await {
                    match outcome.result {
                        Ok(_) => applied += 1,
                        Err(e) => {
                            refused += 1;
                            warn!(kind = outcome.operation.kind(), error = %e, "operation not applied");
                        }
                    }
                }
            }

            info!(applied, refused, "async replay finished");
            Ok(())
        })
    }
}
