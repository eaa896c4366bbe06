//! Asynchronous CSV reader with batch interface
//!
//! Reads `LedgerOperation`s in batches through csv-async, so the async
//! strategy can hand each batch to the batch processor.
//!
//! ```text
//! CSV file → AsyncReader → Vec<LedgerOperation> per batch
//!                 ↓
//!          csv_format module
//! ```

use csv_async::AsyncReaderBuilder;
use futures::io::AsyncRead;
use futures::stream::StreamExt;
use tracing::warn;

use crate::io::csv_format::{convert_csv_record, CsvRecord};
use crate::types::LedgerOperation;

pub struct AsyncReader<R: AsyncRead + Unpin> {
    csv_reader: csv_async::AsyncDeserializer<R>,
}

impl<R: AsyncRead + Unpin + Send + 'static> AsyncReader<R> {
    pub fn new(reader: R) -> Self {
        let csv_reader = AsyncReaderBuilder::new()
            .flexible(true)
            .trim(csv_async::Trim::All)
            .create_deserializer(reader);

        Self { csv_reader }
    }

    /// Read up to `batch_size` operations
    ///
    /// Malformed rows are logged and skipped, so a batch can hold fewer
    /// operations than rows consumed.
    ///
    /// # Returns
    ///
    /// The decoded operations, or an empty vector at end of input.
    pub async fn read_batch(&mut self, batch_size: usize) -> Vec<LedgerOperation> {
        let mut batch = Vec::with_capacity(batch_size);
        let mut records = self.csv_reader.deserialize::<CsvRecord>();

        while batch.len() < batch_size {
            match records.next().await {
                Some(Ok(csv_record)) => match convert_csv_record(csv_record) {
                    Ok(operation) => batch.push(operation),
                    Err(e) => warn!(error = %e, "skipping malformed row"),
                },
                Some(Err(e)) => warn!(error = %e, "CSV parse error"),
                None => break,
            }
        }

        batch
    }
}
