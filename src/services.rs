//! Composition root
//!
//! `LedgerServices` builds the registry, stores, engine, order coordinator and
//! ledger book from a `LedgerConfig` and replays `LedgerOperation`s against
//! them. Both processing strategies drive one shared instance.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::{LedgerConfig, TokenKindEntry};
use crate::core::{
    ConversionResolver, FundStore, LedgerBook, ListingSource, NewToken, OrderCoordinator,
    TokenRegistry, TransactionEngine, TransactionStore,
};
use crate::types::{
    Fee, Fund, FundKey, LedgerError, LedgerOperation, Listing, ListingId, Order, PortfolioId,
    TokenId, TokenKind, Transaction, TransactionRequest, TransactionType, WalletId,
};

/// What applying one operation produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Deposit or withdrawal: the fund after the move
    Fund(Fund),
    /// Transfer: the journal record, whatever its status
    Transaction(Transaction),
    /// Order: the order after settlement
    Order(Order),
}

#[derive(Debug)]
pub struct LedgerServices {
    registry: Arc<TokenRegistry>,
    funds: Arc<FundStore>,
    journal: Arc<TransactionStore>,
    engine: Arc<TransactionEngine>,
    orders: OrderCoordinator,
    book: LedgerBook,
    listings: HashMap<ListingId, Listing>,
    portfolios: HashMap<PortfolioId, WalletId>,
    treasury_wallet: Option<WalletId>,
}

impl LedgerServices {
    /// Build every component from a validated configuration
    ///
    /// When no currency is configured a `USD` currency at rate 1 is registered
    /// so tokens can default to it.
    ///
    /// # Errors
    ///
    /// Returns `Config` for references to unknown ledgers, currencies or
    /// tokens and for duplicate listings, and the registry's own errors for
    /// duplicate names or invalid token parameters.
    pub fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let registry = Arc::new(TokenRegistry::new());

        for ledger in &config.ledgers {
            registry.add_ledger(&ledger.name)?;
        }
        if config.currencies.is_empty() {
            registry.add_currency("USD", Decimal::ONE)?;
        }
        for currency in &config.currencies {
            registry.add_currency(&currency.code, currency.usd_rate)?;
        }

        for entry in &config.tokens {
            let ledger = registry.find_ledger_by_name(&entry.ledger).ok_or_else(|| {
                LedgerError::config(format!(
                    "token {} refers to unknown ledger {}",
                    entry.symbol, entry.ledger
                ))
            })?;
            let currency = registry
                .find_currency_by_code(&entry.currency)
                .ok_or_else(|| {
                    LedgerError::config(format!(
                        "token {} refers to unknown currency {}",
                        entry.symbol, entry.currency
                    ))
                })?;
            let kind = match (entry.kind, entry.creator) {
                (TokenKindEntry::Custom, Some(creator)) => TokenKind::Custom { creator },
                (TokenKindEntry::Custom, None) => {
                    return Err(LedgerError::config(format!(
                        "custom token {} needs a creator",
                        entry.symbol
                    )))
                }
                (TokenKindEntry::Platform, _) => TokenKind::Platform,
            };
            registry.add_token(NewToken {
                symbol: entry.symbol.clone(),
                decimals: entry.decimals,
                ledger_id: ledger.id,
                currency_id: currency.id,
                kind,
                total_supply: entry.total_supply,
            })?;
        }

        let conversions = Arc::new(ConversionResolver::new(Arc::clone(&registry)));
        for entry in &config.conversions {
            let from = known_token(&registry, &entry.from, "conversion")?;
            let to = known_token(&registry, &entry.to, "conversion")?;
            conversions.add(from, to, entry.rate)?;
        }

        let mut listings = HashMap::new();
        for entry in &config.listings {
            let token_id = known_token(&registry, &entry.token, "listing")?;
            let listing = Listing {
                id: entry.id,
                market_wallet_id: entry.market_wallet,
                token_id,
                price: entry.price,
            };
            if listings.insert(entry.id, listing).is_some() {
                return Err(LedgerError::config(format!(
                    "listing {} is defined twice",
                    entry.id
                )));
            }
        }

        let portfolios = config
            .portfolios
            .iter()
            .map(|entry| (entry.id, entry.wallet))
            .collect();

        let funds = Arc::new(FundStore::new());
        let journal = Arc::new(TransactionStore::new());
        let engine = Arc::new(TransactionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&funds),
            conversions,
            Arc::clone(&journal),
            config.engine,
        ));
        let orders = OrderCoordinator::new(Arc::clone(&engine), config.orders.clone());
        let book = LedgerBook::new(Arc::clone(&registry), Arc::clone(&journal));

        info!(
            ledgers = config.ledgers.len(),
            tokens = config.tokens.len(),
            listings = listings.len(),
            "ledger services ready"
        );

        Ok(Self {
            registry,
            funds,
            journal,
            engine,
            orders,
            book,
            listings,
            portfolios,
            treasury_wallet: config.orders.treasury_wallet,
        })
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    pub fn funds(&self) -> &Arc<FundStore> {
        &self.funds
    }

    pub fn journal(&self) -> &Arc<TransactionStore> {
        &self.journal
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    pub fn orders(&self) -> &OrderCoordinator {
        &self.orders
    }

    pub fn book(&self) -> &LedgerBook {
        &self.book
    }

    /// Apply one replayed operation
    ///
    /// Funds named by the operation are created on first use, so a transfer
    /// out of a wallet that never received anything settles as a failed
    /// transaction rather than an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the operation never reached the journal: unknown
    /// token symbols or listings, invalid deposit/withdraw amounts, an
    /// insufficient balance on withdrawal, or storage failure.
    pub fn apply(&self, operation: LedgerOperation) -> Result<Outcome, LedgerError> {
        debug!(kind = operation.kind(), "applying operation");
        match operation {
            LedgerOperation::Deposit { fund, amount } => {
                let fund = self.resolve_fund(&fund)?;
                self.engine.deposit(fund.id, amount).map(Outcome::Fund)
            }
            LedgerOperation::Withdraw { fund, amount } => {
                let fund = self.resolve_fund(&fund)?;
                self.engine.withdraw(fund.id, amount).map(Outcome::Fund)
            }
            LedgerOperation::Transfer {
                from,
                to,
                amount,
                fee,
                toll,
            } => {
                let source = self.registry.find_token_by_symbol(&from.token)?;
                let from_fund = self.resolve_fund(&from)?;
                let to_fund = self.resolve_fund(&to)?;
                let fee = if fee.is_zero() {
                    Fee::None
                } else {
                    match toll {
                        Some(wallet) => Fee::Toll {
                            fund_id: self.funds.get_or_create(wallet, source.id)?.id,
                            amount: fee,
                        },
                        None => Fee::Burn { amount: fee },
                    }
                };
                let tx_type = if from_fund.token_id == to_fund.token_id {
                    TransactionType::Payment
                } else {
                    TransactionType::Exchange
                };
                let request = TransactionRequest::new(
                    from_fund.id,
                    to_fund.id,
                    amount,
                    source.currency_id,
                    source.ledger_id,
                )
                .with_fee(fee)
                .with_type(tx_type);
                self.engine.submit(request).map(Outcome::Transaction)
            }
            LedgerOperation::Order {
                portfolio,
                token,
                listing,
                quantity,
            } => {
                let listing = self
                    .listings
                    .listing(listing)
                    .ok_or(LedgerError::ListingNotFound { listing })?;
                let token = self.registry.find_token_by_symbol(&token)?;
                self.orders
                    .place_order_for(portfolio, token.id, &listing, quantity, &self.portfolios)
                    .map(Outcome::Order)
            }
        }
    }

    /// Every fund an operation may lock
    ///
    /// Two operations with disjoint key sets commute, which is what lets the
    /// batch processor run them concurrently. References that cannot be
    /// resolved contribute no key; such operations fail before touching any
    /// fund.
    pub fn fund_keys(&self, operation: &LedgerOperation) -> Vec<FundKey> {
        match operation {
            LedgerOperation::Deposit { fund, .. } | LedgerOperation::Withdraw { fund, .. } => {
                vec![fund.clone()]
            }
            LedgerOperation::Transfer {
                from, to, toll, ..
            } => {
                let mut keys = vec![from.clone(), to.clone()];
                if let Some(wallet) = toll {
                    keys.push(FundKey::new(*wallet, from.token.clone()));
                }
                keys
            }
            LedgerOperation::Order {
                portfolio,
                token,
                listing,
                ..
            } => {
                let mut keys = Vec::with_capacity(3);
                if let Some(wallet) = self.portfolios.get(portfolio) {
                    keys.push(FundKey::new(*wallet, token.clone()));
                }
                if let Some(treasury) = self.treasury_wallet {
                    keys.push(FundKey::new(treasury, token.clone()));
                }
                if let Some(listing) = self.listings.get(listing) {
                    if let Ok(market_token) = self.registry.find_token(listing.token_id) {
                        keys.push(FundKey::new(listing.market_wallet_id, market_token.symbol));
                    }
                }
                keys
            }
        }
    }

    fn resolve_fund(&self, key: &FundKey) -> Result<Fund, LedgerError> {
        let token = self.registry.find_token_by_symbol(&key.token)?;
        self.funds.get_or_create(key.wallet, token.id)
    }
}

fn known_token(
    registry: &TokenRegistry,
    symbol: &str,
    context: &str,
) -> Result<TokenId, LedgerError> {
    registry
        .find_token_by_symbol(symbol)
        .map(|token| token.id)
        .map_err(|_| LedgerError::config(format!("{} refers to unknown token {}", context, symbol)))
}
