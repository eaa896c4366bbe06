//! Replayable operations read from CSV input

use rust_decimal::Decimal;

use super::fund::WalletId;
use super::order::{ListingId, PortfolioId};

/// A fund addressed the way input files address it: wallet plus token symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FundKey {
    pub wallet: WalletId,
    pub token: String,
}

impl FundKey {
    pub fn new(wallet: WalletId, token: impl Into<String>) -> Self {
        Self {
            wallet,
            token: token.into(),
        }
    }
}

/// One input row, decoded
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOperation {
    /// External inflow that mints supply
    Deposit { fund: FundKey, amount: Decimal },

    /// External outflow that burns supply
    Withdraw { fund: FundKey, amount: Decimal },

    /// Move value between two funds, converting when the tokens differ
    ///
    /// A non-zero fee with no toll wallet is burned.
    Transfer {
        from: FundKey,
        to: FundKey,
        amount: Decimal,
        fee: Decimal,
        toll: Option<WalletId>,
    },

    /// Buy `quantity` units of a listing, paying in `token`
    Order {
        portfolio: PortfolioId,
        token: String,
        listing: ListingId,
        quantity: u32,
    },
}

impl LedgerOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerOperation::Deposit { .. } => "deposit",
            LedgerOperation::Withdraw { .. } => "withdraw",
            LedgerOperation::Transfer { .. } => "transfer",
            LedgerOperation::Order { .. } => "order",
        }
    }
}
