//! Synchronous CSV reader with iterator interface
//!
//! Streams `LedgerOperation`s from a CSV file one row at a time, delegating
//! row decoding to the csv_format module.
//!
//! ```no_run
//! use amber_ledger::io::sync_reader::SyncReader;
//! use std::path::Path;
//!
//! let reader = SyncReader::new(Path::new("operations.csv")).unwrap();
//! for result in reader {
//!     match result {
//!         Ok(operation) => println!("{:?}", operation),
//!         Err(e) => eprintln!("{}", e),
//!     }
//! }
//! ```
//!
//! # Error Handling
//!
//! - Failing to open the file is returned from `new()`
//! - Each malformed row is yielded as a `ParseError` carrying its line number,
//!   and iteration continues with the next row

use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, Trim};

use crate::io::csv_format::{convert_csv_record, CsvRecord};
use crate::types::{LedgerError, LedgerOperation};

#[derive(Debug)]
pub struct SyncReader {
    reader: csv::Reader<File>,
    line_num: u64,
}

impl SyncReader {
    /// Open a CSV file for streaming
    ///
    /// Fields are trimmed and rows may omit trailing columns.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be opened.
    pub fn new(path: &Path) -> Result<Self, LedgerError> {
        let file = File::open(path).map_err(|e| LedgerError::IoError {
            message: format!("Failed to open file '{}': {}", path.display(), e),
        })?;

        let reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .buffer_capacity(8 * 1024)
            .from_reader(file);

        Ok(Self {
            reader,
            line_num: 1,
        })
    }
}

impl Iterator for SyncReader {
    type Item = Result<LedgerOperation, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut deserializer = self.reader.deserialize::<CsvRecord>();
        let row = deserializer.next()?;
        self.line_num += 1;

        let line = Some(self.line_num);
        Some(match row {
            Ok(csv_record) => convert_csv_record(csv_record)
                .map_err(|message| LedgerError::ParseError { line, message }),
            Err(e) => Err(LedgerError::ParseError {
                line,
                message: e.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FundKey;
    use rust_decimal::Decimal;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,wallet,token,counterparty,counter_token,amount,fee,toll\n";

    fn create_temp_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes())
            .expect("Failed to write to temp file");
        file.flush().expect("Failed to flush temp file");
        file
    }

    #[test]
    fn test_sync_reader_fails_on_missing_file() {
        let result = SyncReader::new(Path::new("nonexistent.csv"));
        assert!(matches!(result, Err(LedgerError::IoError { .. })));
    }

    #[test]
    fn test_sync_reader_reads_all_operation_types() {
        let file = create_temp_csv(
            "deposit,1,AMB,,,100,,\n\
             withdraw,1,AMB,,,10,,\n\
             transfer,1,AMB,2,GEM,30,2,3\n\
             order,7,AMB,1,,2,,\n",
        );

        let operations: Vec<_> = SyncReader::new(file.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(operations.len(), 4);
        assert_eq!(
            operations[0],
            LedgerOperation::Deposit {
                fund: FundKey::new(1, "AMB"),
                amount: Decimal::from(100),
            }
        );
        assert_eq!(operations[2].kind(), "transfer");
        assert_eq!(operations[3].kind(), "order");
    }

    #[test]
    fn test_sync_reader_accepts_short_rows() {
        let file = create_temp_csv("deposit,1,AMB,,,100\n");

        let operations: Vec<_> = SyncReader::new(file.path()).unwrap().collect();

        assert_eq!(operations.len(), 1);
        assert!(operations[0].is_ok());
    }

    #[test]
    fn test_sync_reader_reports_line_and_continues() {
        let file = create_temp_csv(
            "deposit,1,AMB,,,100,,\n\
             deposit,1,AMB,,,abc,,\n\
             deposit,x,AMB,,,1,,\n\
             deposit,2,AMB,,,5,,\n",
        );

        let results: Vec<_> = SyncReader::new(file.path()).unwrap().collect();

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(LedgerError::ParseError { line: Some(3), .. })
        ));
        assert!(matches!(
            results[2],
            Err(LedgerError::ParseError { line: Some(4), .. })
        ));
        assert!(results[3].is_ok());
    }

    #[test]
    fn test_sync_reader_handles_whitespace() {
        let file = create_temp_csv("  deposit , 1 , AMB ,,, 7.5 ,,\n");

        let operations: Vec<_> = SyncReader::new(file.path()).unwrap().collect();

        assert_eq!(
            operations[0].as_ref().unwrap(),
            &LedgerOperation::Deposit {
                fund: FundKey::new(1, "AMB"),
                amount: Decimal::new(75, 1),
            }
        );
    }

    #[test]
    fn test_sync_reader_empty_after_header() {
        let file = create_temp_csv("");
        assert_eq!(SyncReader::new(file.path()).unwrap().count(), 0);
    }
}
