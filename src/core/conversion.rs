//! Conversion resolver
//!
//! Directed exchange rates between tokens. `A -> B` and `B -> A` are separate
//! records; a missing record is always an error, never an implicit rate of 1.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::debug;

use super::registry::TokenRegistry;
use crate::types::{Conversion, LedgerError, TokenId};

#[derive(Debug)]
pub struct ConversionResolver {
    registry: Arc<TokenRegistry>,
    rates: DashMap<(TokenId, TokenId), Conversion>,
    next_id: AtomicU32,
}

impl ConversionResolver {
    pub fn new(registry: Arc<TokenRegistry>) -> Self {
        Self {
            registry,
            rates: DashMap::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Register or replace the rate for `from -> to`
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the tokens are the same or the rate is not
    /// positive, `TokenNotFound` if either token is unknown.
    pub fn add(&self, from: TokenId, to: TokenId, rate: Decimal) -> Result<Conversion, LedgerError> {
        if from == to {
            return Err(LedgerError::invalid_request(
                "conversion needs two distinct tokens",
            ));
        }
        if rate <= Decimal::ZERO {
            return Err(LedgerError::invalid_request(format!(
                "conversion rate must be positive, got {}",
                rate
            )));
        }
        self.registry.find_token(from)?;
        self.registry.find_token(to)?;

        let conversion = Conversion {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            from_token_id: from,
            to_token_id: to,
            rate,
        };
        self.rates.insert((from, to), conversion);
        debug!(from, to, %rate, "conversion registered");
        Ok(conversion)
    }

    /// Rate for `from -> to`
    ///
    /// The same token always converts at 1. No rate is ever derived from the
    /// reverse record or through an intermediate token.
    ///
    /// # Errors
    ///
    /// Returns `NoConversionPath` if no direct record exists.
    pub fn rate(&self, from: TokenId, to: TokenId) -> Result<Decimal, LedgerError> {
        if from == to {
            return Ok(Decimal::ONE);
        }
        self.rates
            .get(&(from, to))
            .map(|entry| entry.value().rate)
            .ok_or_else(|| LedgerError::no_conversion_path(from, to))
    }

    /// Convert an amount of `from` into `to`
    ///
    /// The result is `amount * rate`, rounded half-to-even to the destination
    /// token's decimals.
    ///
    /// # Errors
    ///
    /// Returns `NoConversionPath` if no rate exists, `TokenNotFound` if the
    /// destination token is unknown, `ArithmeticOverflow` if the product does
    /// not fit a `Decimal`.
    pub fn convert(&self, amount: Decimal, from: TokenId, to: TokenId) -> Result<Decimal, LedgerError> {
        let rate = self.rate(from, to)?;
        let destination = self.registry.find_token(to)?;
        let raw = amount
            .checked_mul(rate)
            .ok_or_else(|| LedgerError::arithmetic_overflow("convert", 0))?;
        Ok(destination.quantize(raw))
    }

    /// Every registered conversion, sorted by id
    pub fn all(&self) -> Vec<Conversion> {
        let mut all: Vec<Conversion> = self.rates.iter().map(|entry| *entry.value()).collect();
        all.sort_by_key(|conversion| conversion.id);
        all
    }
}
