//! Fund types
//!
//! A Fund is the balance one wallet holds in one token.

use rust_decimal::Decimal;

use super::token::TokenId;

/// Wallet identifier
pub type WalletId = u32;

/// Fund identifier
///
/// Fund ids are assigned in creation order and also define the global lock order.
pub type FundId = u64;

/// Balance of one wallet in one token
#[derive(Debug, Clone, PartialEq)]
pub struct Fund {
    pub id: FundId,
    pub wallet_id: WalletId,
    pub token_id: TokenId,

    /// Current balance, never negative
    pub balance: Decimal,

    /// Retired funds reject new transactions until revived by `get_or_create`
    pub retired: bool,
}

impl Fund {
    /// Create an empty, active fund
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier assigned by the fund store
    /// * `wallet_id` - Owning wallet
    /// * `token_id` - Token the balance is denominated in
    pub fn new(id: FundId, wallet_id: WalletId, token_id: TokenId) -> Self {
        Fund {
            id,
            wallet_id,
            token_id,
            balance: Decimal::ZERO,
            retired: false,
        }
    }
}
