//! Order types
//!
//! An order is a buyer's purchase of a listing. It is settled by exactly one
//! successful transaction and then closed with a receipt.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::LedgerError;
use super::fund::{FundId, WalletId};
use super::token::TokenId;
use super::transaction::TransactionId;

/// Order identifier
pub type OrderId = u64;

/// Listing identifier
pub type ListingId = u32;

/// Portfolio identifier
///
/// A portfolio is the catalog-side owner of a wallet.
pub type PortfolioId = u32;

/// Something for sale, priced in one token and paid into the market's wallet
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub id: ListingId,
    pub market_wallet_id: WalletId,
    pub token_id: TokenId,
    pub price: Decimal,
}

/// Order lifecycle
///
/// `Pending -> Completed` on a successful settlement, `Pending -> Cancelled` on
/// a failed one. Both outcomes are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Proof of payment issued when an order completes
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub order_id: OrderId,
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub buyer_portfolio_id: PortfolioId,
    pub listing_id: ListingId,

    /// Buyer fund the order is paid from
    pub fund_id: FundId,

    pub quantity: u32,

    /// `price * quantity`, in the listing token
    pub total_price: Decimal,

    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,

    /// Every settlement attempt, oldest first
    pub transaction_ids: Vec<TransactionId>,

    pub receipt: Option<Receipt>,
}

impl Order {
    pub fn new(
        id: OrderId,
        buyer_portfolio_id: PortfolioId,
        listing: &Listing,
        fund_id: FundId,
        quantity: u32,
        total_price: Decimal,
    ) -> Self {
        Order {
            id,
            buyer_portfolio_id,
            listing_id: listing.id,
            fund_id,
            quantity,
            total_price,
            status: OrderStatus::Pending,
            timestamp: Utc::now(),
            transaction_ids: Vec::new(),
            receipt: None,
        }
    }

    /// Move the order to a new status
    ///
    /// # Errors
    ///
    /// Returns `InvalidOrderTransition` unless the order is `Pending` and the
    /// target is `Completed` or `Cancelled`.
    pub fn transition(&mut self, to: OrderStatus) -> Result<(), LedgerError> {
        match (self.status, to) {
            (OrderStatus::Pending, OrderStatus::Completed)
            | (OrderStatus::Pending, OrderStatus::Cancelled) => {
                self.status = to;
                Ok(())
            }
            (from, to) => Err(LedgerError::InvalidOrderTransition {
                order: self.id,
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}
