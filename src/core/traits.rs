//! Catalog-side lookups the settlement layer depends on
//!
//! The ledger does not own listings or portfolios. It reads them through these
//! narrow traits so any catalog (an in-memory map, a database, a remote service)
//! can sit behind the coordinator.

use std::collections::HashMap;

use crate::types::{Listing, ListingId, PortfolioId, WalletId};

/// Resolves the wallet a portfolio pays from
pub trait WalletDirectory {
    fn wallet_of(&self, portfolio: PortfolioId) -> Option<WalletId>;
}

/// Resolves listings by id
pub trait ListingSource {
    fn listing(&self, id: ListingId) -> Option<Listing>;
}

impl WalletDirectory for HashMap<PortfolioId, WalletId> {
    fn wallet_of(&self, portfolio: PortfolioId) -> Option<WalletId> {
        self.get(&portfolio).copied()
    }
}

impl ListingSource for HashMap<ListingId, Listing> {
    fn listing(&self, id: ListingId) -> Option<Listing> {
        self.get(&id).cloned()
    }
}
