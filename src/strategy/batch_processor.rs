//! Batch processing with fund-based partitioning
//!
//! `BatchProcessor` splits a batch of operations into groups whose fund sets
//! are disjoint, then runs each group on its own tokio task. Operations inside
//! a group run sequentially in input order.
//!
//! # Design
//!
//! A transfer touches up to three funds and an order up to three, so a simple
//! partition by one key (as for single-account operations) is not enough. The
//! processor unions operations that share any `FundKey`: two operations land
//! in the same group whenever one could observe the other's balance change.
//! Groups therefore commute, and the final balances match a sequential replay
//! of the same input.
//!
//! ```text
//! batch ──► fund_keys(op) ──► union-find ──► groups ──► tokio::spawn per group
//! ```

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, error};

use crate::services::{LedgerServices, Outcome};
use crate::types::{FundKey, LedgerError, LedgerOperation};

/// Result of applying a single operation
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub operation: LedgerOperation,
    pub result: Result<Outcome, LedgerError>,
}

#[derive(Debug, Clone)]
pub struct BatchProcessor {
    services: Arc<LedgerServices>,
}

impl BatchProcessor {
    pub fn new(services: Arc<LedgerServices>) -> Self {
        Self { services }
    }

    /// Partition a batch into groups with disjoint fund sets
    ///
    /// # Guarantees
    ///
    /// - Each operation appears in exactly one group
    /// - Operations sharing a fund, directly or through a chain of other
    ///   operations, share a group
    /// - Each group keeps the input order of its operations
    pub fn partition(&self, batch: Vec<LedgerOperation>) -> Vec<Vec<LedgerOperation>> {
        let mut parents: Vec<usize> = (0..batch.len()).collect();
        let mut owners: HashMap<FundKey, usize> = HashMap::new();

        for (index, operation) in batch.iter().enumerate() {
            for key in self.services.fund_keys(operation) {
                match owners.entry(key) {
                    Entry::Occupied(owner) => union(&mut parents, *owner.get(), index),
                    Entry::Vacant(slot) => {
                        slot.insert(index);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<LedgerOperation>> = BTreeMap::new();
        for (index, operation) in batch.into_iter().enumerate() {
            let root = find(&mut parents, index);
            groups.entry(root).or_default().push(operation);
        }
        groups.into_values().collect()
    }

    /// Apply one group's operations in order
    ///
    /// Failures are captured in the results and do not stop the group.
    pub async fn process_group(&self, operations: Vec<LedgerOperation>) -> Vec<ProcessingResult> {
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            let result = self.services.apply(operation.clone());
            if let Err(err) = &result {
                debug!(kind = operation.kind(), error = %err, "operation not applied");
            }
            results.push(ProcessingResult { operation, result });
        }
        results
    }

    /// Process a batch with one task per fund-disjoint group
    ///
    /// # Returns
    ///
    /// One result per operation. Results of different groups may interleave
    /// in any order; results within a group keep input order.
    pub async fn process_batch(&self, batch: Vec<LedgerOperation>) -> Vec<ProcessingResult> {
        let groups = self.partition(batch);
        debug!(groups = groups.len(), "batch partitioned");

        let mut tasks = Vec::with_capacity(groups.len());
        for operations in groups {
            let processor = self.clone();
            tasks.push(tokio::spawn(async move {
                processor.process_group(operations).await
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            match task.await {
                Ok(group_results) => results.extend(group_results),
                Err(err) => error!(error = %err, "batch task panicked"),
            }
        }
        results
    }
}

fn find(parents: &mut [usize], mut index: usize) -> usize {
    while parents[index] != index {
        parents[index] = parents[parents[index]];
        index = parents[index];
    }
    index
}

fn union(parents: &mut [usize], a: usize, b: usize) {
    let (root_a, root_b) = (find(parents, a), find(parents, b));
    if root_a != root_b {
        // lower index stays root so groups sort by first operation
        let (root, child) = if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        parents[child] = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use rstest::rstest;
    use rust_decimal::Decimal;

    const CATALOG: &str = r#"
ledgers:
  - name: main
tokens:
  - symbol: AMB
    decimals: 4
    ledger: main
"#;

    fn processor() -> BatchProcessor {
        let config = LedgerConfig::from_yaml_str(CATALOG).unwrap();
        BatchProcessor::new(Arc::new(LedgerServices::from_config(&config).unwrap()))
    }

    fn deposit(wallet: u32, amount: i64) -> LedgerOperation {
        LedgerOperation::Deposit {
            fund: FundKey::new(wallet, "AMB"),
            amount: Decimal::from(amount),
        }
    }

    fn transfer(from: u32, to: u32, amount: i64) -> LedgerOperation {
        LedgerOperation::Transfer {
            from: FundKey::new(from, "AMB"),
            to: FundKey::new(to, "AMB"),
            amount: Decimal::from(amount),
            fee: Decimal::ZERO,
            toll: None,
        }
    }

    fn balance(processor: &BatchProcessor, wallet: u32) -> Decimal {
        let services = &processor.services;
        let token = services.registry().find_token_by_symbol("AMB").unwrap();
        let id = services.funds().find(wallet, token.id).unwrap();
        services.funds().get(id).unwrap().balance
    }

    #[rstest]
    #[case::empty(vec![], 0)]
    #[case::independent(vec![deposit(1, 10), deposit(2, 10), deposit(3, 10)], 3)]
    #[case::same_fund(vec![deposit(1, 10), deposit(1, 5)], 1)]
    #[case::chained(vec![transfer(1, 2, 1), transfer(2, 3, 1), deposit(4, 1)], 2)]
    #[case::late_bridge(vec![deposit(1, 1), deposit(2, 1), transfer(1, 2, 1)], 1)]
    fn test_partition_group_count(#[case] batch: Vec<LedgerOperation>, #[case] groups: usize) {
        assert_eq!(processor().partition(batch).len(), groups);
    }

    #[test]
    fn test_partition_keeps_input_order_within_group() {
        let batch = vec![
            deposit(1, 1),
            deposit(9, 1),
            transfer(1, 2, 2),
            deposit(2, 3),
        ];

        let groups = processor().partition(batch);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![deposit(1, 1), transfer(1, 2, 2), deposit(2, 3)]);
        assert_eq!(groups[1], vec![deposit(9, 1)]);
    }

    #[test]
    fn test_partition_no_operations_lost() {
        let batch: Vec<_> = (0..50).map(|i| deposit(i % 7, 1)).collect();
        let groups = processor().partition(batch);

        assert_eq!(groups.len(), 7);
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_process_batch_matches_sequential_replay() {
        let processor = processor();
        let batch = vec![
            deposit(1, 100),
            deposit(3, 50),
            transfer(1, 2, 40),
            transfer(3, 4, 60),
            transfer(2, 1, 10),
            transfer(3, 4, 20),
        ];

        let results = processor.process_batch(batch).await;

        assert_eq!(results.len(), 6);
        assert_eq!(balance(&processor, 1), Decimal::from(70));
        assert_eq!(balance(&processor, 2), Decimal::from(30));
        // the 60 transfer fails, the 20 transfer succeeds
        assert_eq!(balance(&processor, 3), Decimal::from(30));
        assert_eq!(balance(&processor, 4), Decimal::from(20));
    }

    #[tokio::test]
    async fn test_process_group_captures_errors() {
        let processor = processor();
        let results = processor
            .process_group(vec![
                LedgerOperation::Deposit {
                    fund: FundKey::new(1, "NOPE"),
                    amount: Decimal::ONE,
                },
                deposit(1, 5),
            ])
            .await;

        assert!(results[0].result.is_err());
        assert!(results[1].result.is_ok());
    }
}
