//! Catalog and policy configuration
//!
//! A `LedgerConfig` describes everything the engine needs before the first
//! operation: ledgers, currencies, tokens, conversion rates, the listings and
//! portfolios orders refer to, and the engine and order policies. It is loaded
//! from YAML.
//!
//! Monetary values (`price`, `rate`, `fee_rate`, `total_supply`, `usd_rate`) are
//! written as quoted strings so they are parsed as exact decimals.

use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::types::{LedgerError, ListingId, PortfolioId, WalletId};

/// What happens to a fee that has no toll fund
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePolicy {
    /// The fee leaves supply
    #[default]
    AllowBurn,
    /// Requests with a burn fee are rejected
    RequireToll,
}

/// How recovery finishes a transaction interrupted after its debit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Apply the missing credits and succeed
    #[default]
    RollForward,
    /// Return the debit to the source and fail
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fee_policy: FeePolicy,
    pub recovery: RecoveryPolicy,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Share of the order total charged as a fee, in `[0, 1)`
    #[serde(deserialize_with = "decimal")]
    pub fee_rate: Decimal,

    /// Wallet that collects order fees; without it fees are burned
    pub treasury_wallet: Option<WalletId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CurrencyEntry {
    pub code: String,
    #[serde(deserialize_with = "decimal")]
    pub usd_rate: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKindEntry {
    #[default]
    Platform,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenEntry {
    pub symbol: String,
    pub decimals: u32,

    /// Ledger name
    pub ledger: String,

    /// Currency code
    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub kind: TokenKindEntry,

    /// Creator portfolio, required for custom tokens
    #[serde(default)]
    pub creator: Option<PortfolioId>,

    #[serde(default, deserialize_with = "decimal")]
    pub total_supply: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversionEntry {
    pub from: String,
    pub to: String,
    #[serde(deserialize_with = "decimal")]
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingEntry {
    pub id: ListingId,
    pub market_wallet: WalletId,

    /// Token symbol the listing is priced in
    pub token: String,

    #[serde(deserialize_with = "decimal")]
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortfolioEntry {
    pub id: PortfolioId,
    pub wallet: WalletId,
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    pub ledgers: Vec<LedgerEntry>,
    #[serde(default)]
    pub currencies: Vec<CurrencyEntry>,
    pub tokens: Vec<TokenEntry>,
    #[serde(default)]
    pub conversions: Vec<ConversionEntry>,
    #[serde(default)]
    pub listings: Vec<ListingEntry>,
    #[serde(default)]
    pub portfolios: Vec<PortfolioEntry>,
}

impl LedgerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self, LedgerError> {
        let config: LedgerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.ledgers.is_empty() {
            return Err(LedgerError::config("at least one ledger is required"));
        }
        if self.orders.fee_rate < Decimal::ZERO || self.orders.fee_rate >= Decimal::ONE {
            return Err(LedgerError::config(format!(
                "orders.fee_rate must be in [0, 1), got {}",
                self.orders.fee_rate
            )));
        }
        for token in &self.tokens {
            match (token.kind, token.creator) {
                (TokenKindEntry::Custom, None) => {
                    return Err(LedgerError::config(format!(
                        "custom token {} needs a creator",
                        token.symbol
                    )))
                }
                (TokenKindEntry::Platform, Some(_)) => {
                    return Err(LedgerError::config(format!(
                        "platform token {} cannot have a creator",
                        token.symbol
                    )))
                }
                _ => {}
            }
        }
        for listing in &self.listings {
            if listing.price <= Decimal::ZERO {
                return Err(LedgerError::config(format!(
                    "listing {} must have a positive price",
                    listing.id
                )));
            }
        }
        Ok(())
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

fn decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Decimal::from_str(raw.trim()).map_err(|e| {
        serde::de::Error::custom(format!("invalid decimal '{}': {}", raw, e))
    })
}
