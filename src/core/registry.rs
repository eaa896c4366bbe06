//! Token registry
//!
//! Holds ledgers, currencies and tokens. Reference data is registered once at
//! startup; afterwards the only mutation is a supply adjustment made by the
//! transaction engine.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{
    Currency, CurrencyId, Ledger, LedgerError, LedgerId, Token, TokenId, TokenKind,
    MAX_TOKEN_DECIMALS, MIN_TOKEN_DECIMALS,
};

/// Parameters for registering a token
#[derive(Debug, Clone)]
pub struct NewToken {
    pub symbol: String,
    pub decimals: u32,
    pub ledger_id: LedgerId,
    pub currency_id: CurrencyId,
    pub kind: TokenKind,
    pub total_supply: Decimal,
}

#[derive(Debug, Default)]
pub struct TokenRegistry {
    ledgers: DashMap<LedgerId, Ledger>,
    ledger_names: DashMap<String, LedgerId>,
    currencies: DashMap<CurrencyId, Currency>,
    currency_codes: DashMap<String, CurrencyId>,
    tokens: DashMap<TokenId, Token>,
    symbols: DashMap<String, TokenId>,
    next_ledger: AtomicU32,
    next_currency: AtomicU32,
    next_token: AtomicU32,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ledger under a unique name
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEntry` if the name is taken.
    pub fn add_ledger(&self, name: &str) -> Result<Ledger, LedgerError> {
        match self.ledger_names.entry(name.to_string()) {
            Entry::Occupied(_) => Err(LedgerError::duplicate("ledger", name)),
            Entry::Vacant(slot) => {
                let ledger = Ledger {
                    id: self.next_ledger.fetch_add(1, Ordering::SeqCst) + 1,
                    name: name.to_string(),
                };
                self.ledgers.insert(ledger.id, ledger.clone());
                slot.insert(ledger.id);
                debug!(ledger = ledger.id, name, "ledger registered");
                Ok(ledger)
            }
        }
    }

    /// Register a currency under a unique code
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEntry` if the code is taken, `Config` if the USD rate
    /// is not positive.
    pub fn add_currency(
        &self,
        code: &str,
        exchange_rate_to_usd: Decimal,
    ) -> Result<Currency, LedgerError> {
        if exchange_rate_to_usd <= Decimal::ZERO {
            return Err(LedgerError::config(format!(
                "currency {} must have a positive USD rate",
                code
            )));
        }

        match self.currency_codes.entry(code.to_string()) {
            Entry::Occupied(_) => Err(LedgerError::duplicate("currency", code)),
            Entry::Vacant(slot) => {
                let currency = Currency {
                    id: self.next_currency.fetch_add(1, Ordering::SeqCst) + 1,
                    code: code.to_string(),
                    exchange_rate_to_usd,
                };
                self.currencies.insert(currency.id, currency.clone());
                slot.insert(currency.id);
                Ok(currency)
            }
        }
    }

    /// Register a token
    ///
    /// # Arguments
    ///
    /// * `new` - Symbol, precision, owning ledger, pricing currency, kind and
    ///   initial supply
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `decimals` is outside `4..=18` (`Config`)
    /// - the initial supply is negative or finer than `decimals` (`Config`)
    /// - the ledger or currency does not exist
    /// - the symbol is already registered (`DuplicateEntry`)
    pub fn add_token(&self, new: NewToken) -> Result<Token, LedgerError> {
        if !(MIN_TOKEN_DECIMALS..=MAX_TOKEN_DECIMALS).contains(&new.decimals) {
            return Err(LedgerError::config(format!(
                "token {} has {} decimals, expected {}..={}",
                new.symbol, new.decimals, MIN_TOKEN_DECIMALS, MAX_TOKEN_DECIMALS
            )));
        }
        if new.total_supply < Decimal::ZERO
            || new.total_supply.normalize().scale() > new.decimals
        {
            return Err(LedgerError::config(format!(
                "token {} has invalid initial supply {}",
                new.symbol, new.total_supply
            )));
        }
        self.find_ledger(new.ledger_id)?;
        self.find_currency(new.currency_id)?;

        match self.symbols.entry(new.symbol.clone()) {
            Entry::Occupied(_) => Err(LedgerError::duplicate("token", &new.symbol)),
            Entry::Vacant(slot) => {
                let token = Token {
                    id: self.next_token.fetch_add(1, Ordering::SeqCst) + 1,
                    symbol: new.symbol,
                    decimals: new.decimals,
                    total_supply: new.total_supply,
                    ledger_id: new.ledger_id,
                    currency_id: new.currency_id,
                    kind: new.kind,
                };
                self.tokens.insert(token.id, token.clone());
                slot.insert(token.id);
                debug!(token = token.id, symbol = %token.symbol, "token registered");
                Ok(token)
            }
        }
    }

    pub fn find_token(&self, id: TokenId) -> Result<Token, LedgerError> {
        self.tokens
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LedgerError::token_not_found(id))
    }

    pub fn find_token_by_symbol(&self, symbol: &str) -> Result<Token, LedgerError> {
        let id = self
            .symbols
            .get(symbol)
            .map(|entry| *entry.value())
            .ok_or_else(|| LedgerError::token_not_found(symbol))?;
        self.find_token(id)
    }

    pub fn find_ledger(&self, id: LedgerId) -> Result<Ledger, LedgerError> {
        self.ledgers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LedgerError::ledger_not_found(id))
    }

    /// Look up a ledger by its unique name
    pub fn find_ledger_by_name(&self, name: &str) -> Option<Ledger> {
        let id = *self.ledger_names.get(name)?.value();
        self.ledgers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn find_currency(&self, id: CurrencyId) -> Result<Currency, LedgerError> {
        self.currencies
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(LedgerError::CurrencyNotFound { currency: id })
    }

    pub fn find_currency_by_code(&self, code: &str) -> Option<Currency> {
        let id = *self.currency_codes.get(code)?.value();
        self.currencies.get(&id).map(|entry| entry.value().clone())
    }

    /// Every token issued on a ledger, sorted by id
    pub fn tokens_of(&self, ledger: LedgerId) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .tokens
            .iter()
            .filter(|entry| entry.value().ledger_id == ledger)
            .map(|entry| entry.value().clone())
            .collect();
        tokens.sort_by_key(|token| token.id);
        tokens
    }

    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .tokens
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tokens.sort_by_key(|token| token.id);
        tokens
    }

    pub fn ledgers(&self) -> Vec<Ledger> {
        let mut ledgers: Vec<Ledger> = self
            .ledgers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        ledgers.sort_by_key(|ledger| ledger.id);
        ledgers
    }

    /// Move a token's circulating supply by `delta`
    ///
    /// Positive deltas mint, negative deltas burn.
    pub(crate) fn adjust_supply(&self, token: TokenId, delta: Decimal) -> Result<(), LedgerError> {
        let mut entry = self
            .tokens
            .get_mut(&token)
            .ok_or_else(|| LedgerError::token_not_found(token))?;
        let supply = entry.total_supply;
        entry.total_supply = supply.checked_add(delta).ok_or_else(|| {
            LedgerError::config(format!("supply of token {} overflowed", token))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn registry() -> (TokenRegistry, LedgerId, CurrencyId) {
        let registry = TokenRegistry::new();
        let ledger = registry.add_ledger("main").unwrap();
        let currency = registry.add_currency("USD", Decimal::ONE).unwrap();
        (registry, ledger.id, currency.id)
    }

    fn new_token(symbol: &str, decimals: u32, ledger: LedgerId, currency: CurrencyId) -> NewToken {
        NewToken {
            symbol: symbol.to_string(),
            decimals,
            ledger_id: ledger,
            currency_id: currency,
            kind: TokenKind::Platform,
            total_supply: Decimal::ZERO,
        }
    }

    #[test]
    fn test_add_and_find_token() {
        let (registry, ledger, currency) = registry();

        let token = registry
            .add_token(new_token("AMB", 4, ledger, currency))
            .unwrap();

        assert_eq!(registry.find_token(token.id).unwrap(), token);
        assert_eq!(registry.find_token_by_symbol("AMB").unwrap(), token);
        assert_eq!(registry.tokens_of(ledger), vec![token]);
    }

    #[rstest]
    #[case::too_few(3)]
    #[case::too_many(19)]
    fn test_decimals_out_of_range(#[case] decimals: u32) {
        let (registry, ledger, currency) = registry();
        assert!(matches!(
            registry.add_token(new_token("AMB", decimals, ledger, currency)),
            Err(LedgerError::Config { .. })
        ));
    }

    #[rstest]
    #[case::min(4)]
    #[case::max(18)]
    fn test_decimals_in_range(#[case] decimals: u32) {
        let (registry, ledger, currency) = registry();
        assert!(registry
            .add_token(new_token("AMB", decimals, ledger, currency))
            .is_ok());
    }

    #[test]
    fn test_unique_keys() {
        let (registry, ledger, currency) = registry();
        registry
            .add_token(new_token("AMB", 4, ledger, currency))
            .unwrap();

        assert!(matches!(
            registry.add_token(new_token("AMB", 6, ledger, currency)),
            Err(LedgerError::DuplicateEntry { .. })
        ));
        assert!(matches!(
            registry.add_ledger("main"),
            Err(LedgerError::DuplicateEntry { .. })
        ));
        assert!(matches!(
            registry.add_currency("USD", Decimal::ONE),
            Err(LedgerError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_token_requires_known_ledger_and_currency() {
        let (registry, ledger, currency) = registry();
        assert_eq!(
            registry.add_token(new_token("AMB", 4, 99, currency)),
            Err(LedgerError::ledger_not_found(99))
        );
        assert_eq!(
            registry.add_token(new_token("AMB", 4, ledger, 99)),
            Err(LedgerError::CurrencyNotFound { currency: 99 })
        );
    }

    #[test]
    fn test_adjust_supply() {
        let (registry, ledger, currency) = registry();
        let token = registry
            .add_token(new_token("AMB", 4, ledger, currency))
            .unwrap();

        registry.adjust_supply(token.id, Decimal::from(100)).unwrap();
        registry.adjust_supply(token.id, Decimal::from(-30)).unwrap();

        assert_eq!(
            registry.find_token(token.id).unwrap().total_supply,
            Decimal::from(70)
        );
    }

    #[test]
    fn test_lookup_by_name_and_code() {
        let (registry, ledger, currency) = registry();
        assert_eq!(registry.find_ledger_by_name("main").unwrap().id, ledger);
        assert_eq!(registry.find_currency_by_code("USD").unwrap().id, currency);
        assert!(registry.find_ledger_by_name("other").is_none());
    }
}
