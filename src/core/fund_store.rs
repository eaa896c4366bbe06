//! Thread-safe fund storage
//!
//! This module provides the `FundStore`, the only component that mutates a
//! balance, and the `UnitOfWork` the engine uses to apply one transaction's
//! debits and credits atomically.
//!
//! # Design
//!
//! Each fund lives behind its own `Arc<Mutex<Fund>>` inside a `DashMap`, so
//! transactions on disjoint funds never contend. A `(wallet, token)` index makes
//! `get_or_create` race-free: two threads asking for the same pair always end up
//! with the same fund.
//!
//! # Lock Ordering
//!
//! A `UnitOfWork` always acquires fund locks in ascending `FundId` order. Any two
//! transactions therefore lock their shared funds in the same order and cannot
//! deadlock, regardless of which direction value flows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::types::{Fund, FundId, LedgerError, TokenId, WalletId};

/// Shared handle to one fund's lock
#[derive(Debug, Clone)]
pub struct FundHandle {
    pub id: FundId,
    fund: Arc<Mutex<Fund>>,
}

/// Concurrent store of every fund
#[derive(Debug)]
pub struct FundStore {
    /// Fund state by id, each behind its own lock
    funds: DashMap<FundId, Arc<Mutex<Fund>>>,

    /// At most one fund per (wallet, token)
    index: DashMap<(WalletId, TokenId), FundId>,

    next_id: AtomicU64,
}

impl FundStore {
    pub fn new() -> Self {
        Self {
            funds: DashMap::new(),
            index: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Get the fund for a (wallet, token) pair, creating an empty one if needed
    ///
    /// Concurrent calls for the same pair all return the same fund. A retired
    /// fund is revived.
    ///
    /// # Arguments
    ///
    /// * `wallet` - Owning wallet
    /// * `token` - Token the fund is denominated in
    ///
    /// # Returns
    ///
    /// A snapshot of the fund after the call
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the fund's lock is poisoned.
    pub fn get_or_create(&self, wallet: WalletId, token: TokenId) -> Result<Fund, LedgerError> {
        let id = *self.index.entry((wallet, token)).or_insert_with(|| {
            let id = self.allocate_id();
            self.funds
                .insert(id, Arc::new(Mutex::new(Fund::new(id, wallet, token))));
            debug!(fund = id, wallet, token, "fund created");
            id
        });

        let handle = self.handle(id)?;
        let mut fund = lock(&handle)?;
        if fund.retired {
            fund.retired = false;
            debug!(fund = id, "fund revived");
        }
        Ok(fund.clone())
    }

    /// Create a fund for a (wallet, token) pair that must not exist yet
    ///
    /// # Errors
    ///
    /// Returns `DuplicateFundConstraint` if the pair already has a fund.
    pub fn open(&self, wallet: WalletId, token: TokenId) -> Result<Fund, LedgerError> {
        use dashmap::mapref::entry::Entry;

        match self.index.entry((wallet, token)) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateFundConstraint { wallet, token }),
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                let fund = Fund::new(id, wallet, token);
                self.funds.insert(id, Arc::new(Mutex::new(fund.clone())));
                slot.insert(id);
                debug!(fund = id, wallet, token, "fund opened");
                Ok(fund)
            }
        }
    }

    /// Snapshot of a fund by id
    ///
    /// # Errors
    ///
    /// Returns `FundNotFound` for an unknown id, `StorageUnavailable` for a
    /// poisoned lock.
    pub fn get(&self, id: FundId) -> Result<Fund, LedgerError> {
        let handle = self.handle(id)?;
        let fund = lock(&handle)?;
        Ok(fund.clone())
    }

    /// Id of the fund a wallet holds in a token, if any
    pub fn find(&self, wallet: WalletId, token: TokenId) -> Option<FundId> {
        self.index.get(&(wallet, token)).map(|entry| *entry.value())
    }

    /// Debit a single fund
    ///
    /// The debit either applies in full or not at all.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds` if the balance is below `amount`.
    pub fn debit(&self, id: FundId, amount: Decimal) -> Result<(), LedgerError> {
        let handle = self.handle(id)?;
        let mut fund = lock(&handle)?;
        debit_in_place(&mut fund, amount)
    }

    /// Credit a single fund
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the new balance does not fit a `Decimal`.
    pub fn credit(&self, id: FundId, amount: Decimal) -> Result<(), LedgerError> {
        let handle = self.handle(id)?;
        let mut fund = lock(&handle)?;
        credit_in_place(&mut fund, amount)
    }

    /// Snapshot of every fund, sorted by id
    pub fn balances(&self) -> Result<Vec<Fund>, LedgerError> {
        // Collect handles first so no map shard is held while waiting on a fund lock
        let handles: Vec<Arc<Mutex<Fund>>> = self
            .funds
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut funds = handles
            .iter()
            .map(|handle| lock(handle).map(|fund| fund.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        funds.sort_by_key(|fund| fund.id);
        Ok(funds)
    }

    /// Sum of all balances held in a token
    pub fn total_balance(&self, token: TokenId) -> Result<Decimal, LedgerError> {
        self.balances()?
            .iter()
            .filter(|fund| fund.token_id == token)
            .try_fold(Decimal::ZERO, |acc, fund| {
                acc.checked_add(fund.balance)
                    .ok_or_else(|| LedgerError::arithmetic_overflow("total_balance", fund.id))
            })
    }

    /// Retire an empty fund
    ///
    /// # Errors
    ///
    /// Returns `FundNotEmpty` if the fund still holds a balance.
    pub fn retire(&self, id: FundId) -> Result<Fund, LedgerError> {
        let handle = self.handle(id)?;
        let mut fund = lock(&handle)?;
        if !fund.balance.is_zero() {
            return Err(LedgerError::FundNotEmpty {
                fund: id,
                balance: fund.balance,
            });
        }
        fund.retired = true;
        debug!(fund = id, "fund retired");
        Ok(fund.clone())
    }

    /// Handles for a set of funds, sorted by id with duplicates removed
    ///
    /// # Errors
    ///
    /// Returns `FundNotFound` for the first unknown id.
    pub fn handles(&self, ids: &[FundId]) -> Result<Vec<FundHandle>, LedgerError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        ids.into_iter()
            .map(|id| {
                self.handle(id).map(|fund| FundHandle { id, fund })
            })
            .collect()
    }

    fn handle(&self, id: FundId) -> Result<Arc<Mutex<Fund>>, LedgerError> {
        self.funds
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LedgerError::fund_not_found(id))
    }

    fn allocate_id(&self) -> FundId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for FundStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(handle: &Mutex<Fund>) -> Result<MutexGuard<'_, Fund>, LedgerError> {
    handle
        .lock()
        .map_err(|_| LedgerError::storage_unavailable("fund lock poisoned"))
}

fn debit_in_place(fund: &mut Fund, amount: Decimal) -> Result<(), LedgerError> {
    if fund.balance < amount {
        return Err(LedgerError::insufficient_funds(fund.id, fund.balance, amount));
    }
    fund.balance = fund
        .balance
        .checked_sub(amount)
        .ok_or_else(|| LedgerError::arithmetic_overflow("debit", fund.id))?;
    Ok(())
}

fn credit_in_place(fund: &mut Fund, amount: Decimal) -> Result<(), LedgerError> {
    fund.balance = fund
        .balance
        .checked_add(amount)
        .ok_or_else(|| LedgerError::arithmetic_overflow("credit", fund.id))?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Debited(FundId, Decimal),
    Credited(FundId, Decimal),
}

/// Exclusive access to a set of funds for the duration of one transaction
///
/// Every applied step is written to an undo log. Dropping the unit without
/// calling `rollback` keeps whatever was applied, which is exactly what a
/// crash between two steps looks like to recovery.
pub struct UnitOfWork<'a> {
    guards: Vec<MutexGuard<'a, Fund>>,
    undo: Vec<Step>,
}

impl<'a> UnitOfWork<'a> {
    /// Lock every fund in `handles`, in ascending id order
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if any lock is poisoned. Locks acquired so
    /// far are released.
    pub fn acquire(handles: &'a [FundHandle]) -> Result<Self, LedgerError> {
        let mut ordered: Vec<&FundHandle> = handles.iter().collect();
        ordered.sort_by_key(|handle| handle.id);

        let guards = ordered
            .into_iter()
            .map(|handle| {
                handle.fund.lock().map_err(|_| {
                    LedgerError::storage_unavailable(format!("fund {} lock poisoned", handle.id))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            guards,
            undo: Vec::new(),
        })
    }

    /// Lock every fund in `handles`, adopting locks poisoned by a crashed writer
    ///
    /// Only recovery may use this: it is the one caller that knows how to make
    /// a half-applied fund consistent again.
    pub fn acquire_recovering(handles: &'a [FundHandle]) -> Self {
        let mut ordered: Vec<&FundHandle> = handles.iter().collect();
        ordered.sort_by_key(|handle| handle.id);

        let guards = ordered
            .into_iter()
            .map(|handle| {
                handle.fund.lock().unwrap_or_else(|poisoned| {
                    warn!(fund = handle.id, "adopting poisoned fund lock");
                    handle.fund.clear_poison();
                    poisoned.into_inner()
                })
            })
            .collect();

        Self {
            guards,
            undo: Vec::new(),
        }
    }

    /// Locked fund by id
    ///
    /// # Errors
    ///
    /// Returns `FundNotFound` if the fund is not part of this unit.
    pub fn fund(&self, id: FundId) -> Result<&Fund, LedgerError> {
        self.guards
            .iter()
            .find(|guard| guard.id == id)
            .map(|guard| &**guard)
            .ok_or_else(|| LedgerError::fund_not_found(id))
    }

    fn fund_mut(&mut self, id: FundId) -> Result<&mut Fund, LedgerError> {
        self.guards
            .iter_mut()
            .find(|guard| guard.id == id)
            .map(|guard| &mut **guard)
            .ok_or_else(|| LedgerError::fund_not_found(id))
    }

    /// Debit a locked fund and log the step
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds` without changing the balance when the fund
    /// cannot cover `amount`.
    pub fn debit(&mut self, id: FundId, amount: Decimal) -> Result<(), LedgerError> {
        debit_in_place(self.fund_mut(id)?, amount)?;
        self.undo.push(Step::Debited(id, amount));
        Ok(())
    }

    /// Credit a locked fund and log the step
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` without changing the balance on overflow.
    pub fn credit(&mut self, id: FundId, amount: Decimal) -> Result<(), LedgerError> {
        credit_in_place(self.fund_mut(id)?, amount)?;
        self.undo.push(Step::Credited(id, amount));
        Ok(())
    }

    /// Sum of every debit applied through this unit
    pub fn debited(&self) -> Decimal {
        self.undo
            .iter()
            .map(|step| match step {
                Step::Debited(_, amount) => *amount,
                Step::Credited(..) => Decimal::ZERO,
            })
            .sum()
    }

    /// Undo every applied step, newest first
    ///
    /// The locks stay held until the unit is dropped, so the caller can
    /// resolve its journal record before anyone else sees the funds.
    ///
    /// # Errors
    ///
    /// Returns `RollbackFailed` naming the fund whose compensating step could
    /// not be applied, which would mean a balance changed behind this unit's
    /// locks.
    pub fn rollback(&mut self) -> Result<(), LedgerError> {
        while let Some(step) = self.undo.pop() {
            let (id, result) = match step {
                Step::Debited(id, amount) => (id, credit_in_place(self.fund_mut(id)?, amount)),
                Step::Credited(id, amount) => (id, debit_in_place(self.fund_mut(id)?, amount)),
            };
            result.map_err(|err| LedgerError::RollbackFailed {
                fund: id,
                message: err.to_string(),
            })?;
        }
        Ok(())
    }

    /// Keep every applied step and release the locks
    pub fn commit(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;

    fn funded(store: &FundStore, wallet: WalletId, amount: i64) -> FundId {
        let fund = store.get_or_create(wallet, 1).unwrap();
        store.credit(fund.id, Decimal::from(amount)).unwrap();
        fund.id
    }

    #[test]
    fn test_get_or_create_creates_empty_fund() {
        let store = FundStore::new();

        let fund = store.get_or_create(10, 1).unwrap();

        assert_eq!(fund.wallet_id, 10);
        assert_eq!(fund.token_id, 1);
        assert_eq!(fund.balance, Decimal::ZERO);
        assert!(!fund.retired);
    }

    #[test]
    fn test_get_or_create_returns_existing_fund() {
        let store = FundStore::new();

        let first = store.get_or_create(10, 1).unwrap();
        store.credit(first.id, Decimal::from(5)).unwrap();
        let second = store.get_or_create(10, 1).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.balance, Decimal::from(5));
    }

    #[test]
    fn test_open_rejects_duplicate_pair() {
        let store = FundStore::new();
        store.open(10, 1).unwrap();

        assert_eq!(
            store.open(10, 1),
            Err(LedgerError::DuplicateFundConstraint {
                wallet: 10,
                token: 1
            })
        );
        assert!(store.open(10, 2).is_ok());
    }

    #[rstest]
    #[case::exact(100, 100, "0")]
    #[case::partial(100, 30, "70")]
    fn test_debit_success(#[case] balance: i64, #[case] amount: i64, #[case] expected: &str) {
        let store = FundStore::new();
        let id = funded(&store, 1, balance);

        store.debit(id, Decimal::from(amount)).unwrap();

        assert_eq!(
            store.get(id).unwrap().balance,
            expected.parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn test_debit_insufficient_leaves_balance() {
        let store = FundStore::new();
        let id = funded(&store, 1, 10);

        let result = store.debit(id, Decimal::from(32));

        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds { fund, .. }) if fund == id
        ));
        assert_eq!(store.get(id).unwrap().balance, Decimal::from(10));
    }

    #[test]
    fn test_credit_overflow_is_reported() {
        let store = FundStore::new();
        let id = funded(&store, 1, 1);
        store.credit(id, Decimal::MAX - Decimal::ONE).unwrap();

        assert!(matches!(
            store.credit(id, Decimal::from(10)),
            Err(LedgerError::ArithmeticOverflow { .. })
        ));
        assert_eq!(store.get(id).unwrap().balance, Decimal::MAX);
    }

    #[test]
    fn test_unknown_fund_is_not_found() {
        let store = FundStore::new();
        assert_eq!(store.get(42), Err(LedgerError::fund_not_found(42)));
        assert_eq!(
            store.debit(42, Decimal::ONE),
            Err(LedgerError::fund_not_found(42))
        );
    }

    #[test]
    fn test_retire_requires_zero_balance_and_revives() {
        let store = FundStore::new();
        let id = funded(&store, 1, 3);

        assert!(matches!(
            store.retire(id),
            Err(LedgerError::FundNotEmpty { .. })
        ));

        store.debit(id, Decimal::from(3)).unwrap();
        assert!(store.retire(id).unwrap().retired);

        let revived = store.get_or_create(1, 1).unwrap();
        assert_eq!(revived.id, id);
        assert!(!revived.retired);
    }

    #[test]
    fn test_total_balance_per_token() {
        let store = FundStore::new();
        funded(&store, 1, 10);
        funded(&store, 2, 15);
        let other = store.get_or_create(1, 2).unwrap();
        store.credit(other.id, Decimal::from(99)).unwrap();

        assert_eq!(store.total_balance(1).unwrap(), Decimal::from(25));
        assert_eq!(store.total_balance(2).unwrap(), Decimal::from(99));
    }

    #[test]
    fn test_handles_are_sorted_and_deduplicated() {
        let store = FundStore::new();
        let a = store.get_or_create(1, 1).unwrap().id;
        let b = store.get_or_create(2, 1).unwrap().id;

        let handles = store.handles(&[b, a, b]).unwrap();
        let ids: Vec<FundId> = handles.iter().map(|h| h.id).collect();

        assert_eq!(ids, vec![a, b]);
        assert!(store.handles(&[a, 99]).is_err());
    }

    #[test]
    fn test_unit_of_work_rollback_restores_balances() {
        let store = FundStore::new();
        let from = funded(&store, 1, 100);
        let to = funded(&store, 2, 0);
        let handles = store.handles(&[from, to]).unwrap();

        let mut unit = UnitOfWork::acquire(&handles).unwrap();
        unit.debit(from, Decimal::from(40)).unwrap();
        unit.credit(to, Decimal::from(40)).unwrap();
        assert_eq!(unit.fund(to).unwrap().balance, Decimal::from(40));
        unit.rollback().unwrap();
        assert_eq!(unit.debited(), Decimal::ZERO);
        drop(unit);

        assert_eq!(store.get(from).unwrap().balance, Decimal::from(100));
        assert_eq!(store.get(to).unwrap().balance, Decimal::ZERO);
    }

    #[test]
    fn test_unit_of_work_commit_keeps_balances() {
        let store = FundStore::new();
        let from = funded(&store, 1, 100);
        let to = funded(&store, 2, 0);
        let handles = store.handles(&[to, from]).unwrap();

        let mut unit = UnitOfWork::acquire(&handles).unwrap();
        unit.debit(from, Decimal::from(40)).unwrap();
        unit.credit(to, Decimal::from(40)).unwrap();
        unit.commit();

        assert_eq!(store.get(from).unwrap().balance, Decimal::from(60));
        assert_eq!(store.get(to).unwrap().balance, Decimal::from(40));
    }

    #[test]
    fn test_poisoned_lock_is_storage_unavailable_until_recovered() {
        let store = Arc::new(FundStore::new());
        let id = funded(&store, 1, 50);

        let poisoner = Arc::clone(&store);
        let _ = thread::spawn(move || {
            let handles = poisoner.handles(&[id]).unwrap();
            let mut unit = UnitOfWork::acquire(&handles).unwrap();
            unit.debit(id, Decimal::from(20)).unwrap();
            panic!("crash while holding the fund lock");
        })
        .join();

        let handles = store.handles(&[id]).unwrap();
        assert!(matches!(
            UnitOfWork::acquire(&handles),
            Err(LedgerError::StorageUnavailable { .. })
        ));

        let unit = UnitOfWork::acquire_recovering(&handles);
        assert_eq!(unit.fund(id).unwrap().balance, Decimal::from(30));
        unit.commit();

        assert_eq!(store.get(id).unwrap().balance, Decimal::from(30));
    }

    #[test]
    fn test_concurrent_get_or_create_same_pair() {
        let store = Arc::new(FundStore::new());
        let mut handles = vec![];

        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || store.get_or_create(7, 1).unwrap().id));
        }

        let ids: Vec<FundId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.balances().unwrap().len(), 1);
    }
}
