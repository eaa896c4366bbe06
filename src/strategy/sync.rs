//! Synchronous processing strategy
//!
//! Streams rows through `SyncReader` and applies each operation in input
//! order on the calling thread.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::io::sync_reader::SyncReader;
use crate::services::LedgerServices;
use crate::strategy::ProcessingStrategy;
use crate::types::LedgerError;

#[derive(Debug, Clone, Copy)]
pub struct SyncProcessingStrategy;

impl ProcessingStrategy for SyncProcessingStrategy {
    fn process(
        &self,
        input_path: &Path,
        services: &Arc<LedgerServices>,
    ) -> Result<(), LedgerError> {
        let reader = SyncReader::new(input_path)?;
        let (mut applied, mut skipped) = (0usize, 0usize);

        for result in reader {
            match result {
                Ok(operation) => {
                    let kind = operation.kind();
                    match services.apply(operation) {
                        Ok(_) => applied += 1,
                        Err(e) => {
                            skipped += 1;
                            warn!(kind, error = %e, "operation not applied");
                        }
                    }
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping malformed row");
                }
            }
        }

        info!(applied, skipped, "sync replay finished");
        Ok(())
    }
}
