//! Token, currency, ledger and conversion reference data
//!
//! Tokens are the units every Fund is denominated in. A token belongs to exactly
//! one ledger and is priced in exactly one fiat currency.

use rust_decimal::{Decimal, RoundingStrategy};

use super::order::PortfolioId;

/// Token identifier
pub type TokenId = u32;

/// Currency identifier
pub type CurrencyId = u32;

/// Ledger identifier
pub type LedgerId = u32;

/// Smallest number of decimals a token may carry
pub const MIN_TOKEN_DECIMALS: u32 = 4;

/// Largest number of decimals a token may carry
pub const MAX_TOKEN_DECIMALS: u32 = 18;

/// What kind of token this is
///
/// Platform tokens are issued by the platform itself. Custom tokens are minted
/// by a creator and carry a reference to the creator's portfolio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Platform,
    Custom { creator: PortfolioId },
}

/// A unit of account tracked by a ledger
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: TokenId,

    /// Unique ticker, e.g. `AMB`
    pub symbol: String,

    /// Fixed number of fractional digits every amount in this token is held at
    pub decimals: u32,

    /// Circulating supply
    ///
    /// Only the transaction engine moves this: deposits mint, withdrawals and
    /// burned fees destroy, cross-token conversions burn the source and mint
    /// the destination.
    pub total_supply: Decimal,

    pub ledger_id: LedgerId,
    pub currency_id: CurrencyId,
    pub kind: TokenKind,
}

impl Token {
    /// Round an amount to this token's precision using banker's rounding
    pub fn quantize(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.decimals, RoundingStrategy::MidpointNearestEven)
    }

    /// Whether `amount` is representable without rounding in this token
    pub fn fits_precision(&self, amount: Decimal) -> bool {
        amount.normalize().scale() <= self.decimals
    }

    /// Render an amount with exactly `decimals` fractional digits
    pub fn format_amount(&self, amount: Decimal) -> String {
        let mut rounded = self.quantize(amount);
        rounded.rescale(self.decimals);
        rounded.to_string()
    }
}

/// Fiat currency a token is priced in
#[derive(Debug, Clone, PartialEq)]
pub struct Currency {
    pub id: CurrencyId,

    /// ISO code, unique
    pub code: String,

    pub exchange_rate_to_usd: Decimal,
}

/// A named book of tokens and the transactions moving them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    pub id: LedgerId,
    pub name: String,
}

/// Directed exchange rate between two tokens
///
/// `from -> to` and `to -> from` are independent records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion {
    pub id: u32,
    pub from_token_id: TokenId,
    pub to_token_id: TokenId,
    pub rate: Decimal,
}
