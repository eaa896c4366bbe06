//! Order settlement
//!
//! The `OrderCoordinator` turns a purchase into exactly one engine request and
//! drives the order state machine from the outcome:
//!
//! - transaction `Success` -> order `Completed`, receipt issued
//! - transaction `Failed` / `Rejected` -> order `Cancelled`
//! - fatal storage error -> order stays `Pending` and may be retried
//!
//! Each order sits behind its own mutex, so concurrent attempts to settle the
//! same order run one after the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::engine::TransactionEngine;
use super::traits::WalletDirectory;
use crate::config::OrderConfig;
use crate::types::{
    Fee, FundId, LedgerError, Listing, Order, OrderId, OrderStatus, PortfolioId, Receipt, Token,
    TokenId, TransactionRequest, TransactionStatus,
};

/// An order together with the listing it buys
#[derive(Debug)]
struct OrderSlot {
    order: Order,
    listing: Listing,
}

/// What settling an order hands to the engine
enum Attempt {
    Submit(TransactionRequest),
    /// The request could not be priced; record it as rejected with this error
    Reject(TransactionRequest, LedgerError),
}

#[derive(Debug)]
pub struct OrderCoordinator {
    engine: Arc<TransactionEngine>,
    orders: DashMap<OrderId, Arc<Mutex<OrderSlot>>>,
    next_id: AtomicU64,
    config: OrderConfig,
}

impl OrderCoordinator {
    pub fn new(engine: Arc<TransactionEngine>, config: OrderConfig) -> Self {
        Self {
            engine,
            orders: DashMap::new(),
            next_id: AtomicU64::new(0),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Place and settle an order paid from a known fund
    ///
    /// # Arguments
    ///
    /// * `buyer` - Portfolio placing the order
    /// * `buyer_fund_id` - Fund the order is paid from
    /// * `listing` - What is being bought
    /// * `quantity` - How many units
    ///
    /// # Returns
    ///
    /// The order after settlement: `Completed` with a receipt, or `Cancelled`.
    /// An unknown buyer fund cancels the order through a rejected transaction.
    ///
    /// # Errors
    ///
    /// Returns an error before any order is created if the quantity is zero,
    /// the listing token is unknown or the total overflows. Returns
    /// `StorageUnavailable` if settlement hit a poisoned lock; the order then
    /// stays `Pending` and can be retried.
    pub fn place_order(
        &self,
        buyer: PortfolioId,
        buyer_fund_id: FundId,
        listing: &Listing,
        quantity: u32,
    ) -> Result<Order, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::invalid_request("order quantity must be positive"));
        }
        self.engine.registry().find_token(listing.token_id)?;
        let total_price = listing
            .price
            .checked_mul(Decimal::from(quantity))
            .ok_or_else(|| LedgerError::arithmetic_overflow("total_price", buyer_fund_id))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let order = Order::new(id, buyer, listing, buyer_fund_id, quantity, total_price);
        let slot = Arc::new(Mutex::new(OrderSlot {
            order,
            listing: listing.clone(),
        }));
        self.orders.insert(id, Arc::clone(&slot));
        info!(order = id, buyer, listing = listing.id, %total_price, "order placed");

        let mut slot = lock(&slot, id)?;
        self.settle(&mut slot)
    }

    /// Place an order on behalf of a portfolio, paying from its fund in `token`
    ///
    /// The buyer's wallet is resolved through `wallets` and its fund is created
    /// if it does not exist yet.
    pub fn place_order_for(
        &self,
        buyer: PortfolioId,
        token: TokenId,
        listing: &Listing,
        quantity: u32,
        wallets: &dyn WalletDirectory,
    ) -> Result<Order, LedgerError> {
        let wallet = wallets.wallet_of(buyer).ok_or_else(|| {
            LedgerError::invalid_request(format!("portfolio {} has no wallet", buyer))
        })?;
        let fund = self.engine.funds().get_or_create(wallet, token)?;
        self.place_order(buyer, fund.id, listing, quantity)
    }

    /// Settle a pending order again
    ///
    /// Only an order whose previous attempt never produced a transaction (a
    /// fatal storage error) can be retried.
    ///
    /// # Errors
    ///
    /// Returns `OrderNotFound`, `InvalidOrderTransition` if the order is no
    /// longer pending, or `OrderInFlight` if it already has a successful or
    /// pending transaction.
    pub fn retry(&self, order_id: OrderId) -> Result<Order, LedgerError> {
        let slot = self.slot(order_id)?;
        let mut slot = lock(&slot, order_id)?;

        if slot.order.status.is_terminal() {
            return Err(LedgerError::InvalidOrderTransition {
                order: order_id,
                from: slot.order.status.to_string(),
                to: OrderStatus::Pending.to_string(),
            });
        }
        let journal = self.engine.journal();
        if let Some(tx) = journal.of_order(order_id).into_iter().find(|tx| {
            matches!(
                tx.status,
                TransactionStatus::Success | TransactionStatus::Pending
            )
        }) {
            return Err(LedgerError::OrderInFlight {
                order: order_id,
                tx: tx.id,
                status: tx.status,
            });
        }

        info!(order = order_id, "retrying order");
        self.settle(&mut slot)
    }

    pub fn find_order(&self, order_id: OrderId) -> Result<Order, LedgerError> {
        let slot = self.slot(order_id)?;
        let slot = lock(&slot, order_id)?;
        Ok(slot.order.clone())
    }

    /// Every order a portfolio placed, oldest first
    pub fn orders_of(&self, portfolio: PortfolioId) -> Result<Vec<Order>, LedgerError> {
        let slots: Vec<(OrderId, Arc<Mutex<OrderSlot>>)> = self
            .orders
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut orders = Vec::new();
        for (id, slot) in slots {
            let slot = lock(&slot, id)?;
            if slot.order.buyer_portfolio_id == portfolio {
                orders.push(slot.order.clone());
            }
        }
        orders.sort_by_key(|order| order.id);
        Ok(orders)
    }

    fn settle(&self, slot: &mut OrderSlot) -> Result<Order, LedgerError> {
        let tx = match self.build_request(&slot.order, &slot.listing)? {
            Attempt::Submit(request) => self.engine.submit(request)?,
            Attempt::Reject(request, err) => self.engine.reject(&request, err)?,
        };
        let order = &mut slot.order;
        order.transaction_ids.push(tx.id);

        if tx.status == TransactionStatus::Success {
            order.transition(OrderStatus::Completed)?;
            order.receipt = Some(Receipt {
                order_id: order.id,
                transaction_id: tx.id,
                amount: tx.amount,
                fee: tx.fee,
                issued_at: Utc::now(),
            });
            info!(order = order.id, tx = tx.id, "order completed");
        } else {
            order.transition(OrderStatus::Cancelled)?;
            warn!(
                order = order.id,
                tx = tx.id,
                status = tx.status.as_str(),
                "order cancelled"
            );
        }
        Ok(order.clone())
    }

    /// Engine request paying an order from the buyer fund into the market fund
    ///
    /// The amount is the order total, denominated in the buyer's token. When
    /// the buyer fund cannot be found the request still goes to the engine,
    /// which rejects it and leaves a record. When the buyer's token or the fee
    /// cannot be resolved the attempt is recorded as rejected directly, so the
    /// order is cancelled instead of left pending without a transaction.
    fn build_request(&self, order: &Order, listing: &Listing) -> Result<Attempt, LedgerError> {
        let funds = self.engine.funds();
        let registry = self.engine.registry();

        let listing_token = registry.find_token(listing.token_id)?;
        let market_fund = funds.get_or_create(listing.market_wallet_id, listing_token.id)?;
        let unpriced = |from: FundId| {
            TransactionRequest::new(
                from,
                market_fund.id,
                order.total_price,
                listing_token.currency_id,
                listing_token.ledger_id,
            )
            .for_order(order.id)
        };

        let buyer_fund = match funds.get(order.fund_id) {
            Ok(fund) => fund,
            Err(LedgerError::FundNotFound { .. }) => {
                return Ok(Attempt::Submit(unpriced(order.fund_id)))
            }
            Err(err) => return Err(err),
        };

        let priced = registry.find_token(buyer_fund.token_id).and_then(|buyer_token| {
            let fee = self.order_fee(order.total_price, &buyer_token)?;
            Ok(TransactionRequest::new(
                buyer_fund.id,
                market_fund.id,
                order.total_price,
                buyer_token.currency_id,
                buyer_token.ledger_id,
            )
            .with_fee(fee)
            .for_order(order.id))
        });
        match priced {
            Ok(request) => Ok(Attempt::Submit(request)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(Attempt::Reject(unpriced(buyer_fund.id), err)),
        }
    }

    /// Fee charged on an order total, in the buyer's token
    fn order_fee(&self, total_price: Decimal, buyer_token: &Token) -> Result<Fee, LedgerError> {
        let raw = total_price.checked_mul(self.config.fee_rate).ok_or_else(|| {
            LedgerError::invalid_request(format!("fee on {} overflows", total_price))
        })?;
        let amount = buyer_token.quantize(raw);
        if amount.is_zero() {
            return Ok(Fee::None);
        }

        match self.config.treasury_wallet {
            Some(wallet) => {
                let treasury = self.engine.funds().get_or_create(wallet, buyer_token.id)?;
                Ok(Fee::Toll {
                    fund_id: treasury.id,
                    amount,
                })
            }
            None => Ok(Fee::Burn { amount }),
        }
    }

    fn slot(&self, order_id: OrderId) -> Result<Arc<Mutex<OrderSlot>>, LedgerError> {
        self.orders
            .get(&order_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LedgerError::OrderNotFound { order: order_id })
    }
}

fn lock(slot: &Mutex<OrderSlot>, order: OrderId) -> Result<MutexGuard<'_, OrderSlot>, LedgerError> {
    slot.lock()
        .map_err(|_| LedgerError::storage_unavailable(format!("order {} lock poisoned", order)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::conversion::ConversionResolver;
    use crate::core::fund_store::{FundStore, UnitOfWork};
    use crate::core::registry::{NewToken, TokenRegistry};
    use crate::core::transaction_store::TransactionStore;
    use crate::types::{FailureReason, TokenKind, WalletId};
    use std::collections::HashMap;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn coordinator(config: OrderConfig) -> (OrderCoordinator, TokenId) {
        let registry = Arc::new(TokenRegistry::new());
        let ledger = registry.add_ledger("main").unwrap().id;
        let currency = registry.add_currency("USD", Decimal::ONE).unwrap().id;
        let amb = registry
            .add_token(NewToken {
                symbol: "AMB".to_string(),
                decimals: 4,
                ledger_id: ledger,
                currency_id: currency,
                kind: TokenKind::Platform,
                total_supply: Decimal::ZERO,
            })
            .unwrap()
            .id;
        let conversions = Arc::new(ConversionResolver::new(Arc::clone(&registry)));
        let engine = Arc::new(TransactionEngine::new(
            registry,
            Arc::new(FundStore::new()),
            conversions,
            Arc::new(TransactionStore::new()),
            EngineConfig::default(),
        ));
        (OrderCoordinator::new(engine, config), amb)
    }

    fn funded(coordinator: &OrderCoordinator, wallet: WalletId, token: TokenId, amount: &str) -> FundId {
        let fund = coordinator
            .engine()
            .funds()
            .get_or_create(wallet, token)
            .unwrap();
        coordinator.engine().deposit(fund.id, dec(amount)).unwrap();
        fund.id
    }

    fn listing(token: TokenId, price: &str) -> Listing {
        Listing {
            id: 1,
            market_wallet_id: 500,
            token_id: token,
            price: dec(price),
        }
    }

    #[test]
    fn test_successful_order_completes_with_receipt() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "100");

        let order = coordinator
            .place_order(7, buyer, &listing(amb, "5"), 3)
            .unwrap();

        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.total_price, dec("15"));
        assert_eq!(order.transaction_ids.len(), 1);
        let receipt = order.receipt.unwrap();
        assert_eq!(receipt.amount, dec("15"));
        assert_eq!(receipt.transaction_id, order.transaction_ids[0]);

        let funds = coordinator.engine().funds();
        let market = funds.find(500, amb).unwrap();
        assert_eq!(funds.get(buyer).unwrap().balance, dec("85"));
        assert_eq!(funds.get(market).unwrap().balance, dec("15"));
    }

    #[test]
    fn test_failed_order_is_cancelled() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "10");

        let order = coordinator
            .place_order(7, buyer, &listing(amb, "5"), 3)
            .unwrap();

        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.receipt.is_none());
        let tx = coordinator
            .engine()
            .journal()
            .get(order.transaction_ids[0])
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.order_id, Some(order.id));
        assert_eq!(
            coordinator.engine().funds().get(buyer).unwrap().balance,
            dec("10")
        );
    }

    #[test]
    fn test_fee_is_tolled_to_treasury() {
        let (coordinator, amb) = coordinator(OrderConfig {
            fee_rate: dec("0.1"),
            treasury_wallet: Some(900),
        });
        let buyer = funded(&coordinator, 1, amb, "100");

        let order = coordinator
            .place_order(7, buyer, &listing(amb, "5"), 2)
            .unwrap();

        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.receipt.unwrap().fee, dec("1"));
        let funds = coordinator.engine().funds();
        let treasury = funds.find(900, amb).unwrap();
        assert_eq!(funds.get(buyer).unwrap().balance, dec("89"));
        assert_eq!(funds.get(treasury).unwrap().balance, dec("1"));
    }

    #[test]
    fn test_fee_without_treasury_is_burned() {
        let (coordinator, amb) = coordinator(OrderConfig {
            fee_rate: dec("0.1"),
            treasury_wallet: None,
        });
        let buyer = funded(&coordinator, 1, amb, "100");

        coordinator
            .place_order(7, buyer, &listing(amb, "5"), 2)
            .unwrap();

        let registry = coordinator.engine().registry();
        assert_eq!(registry.find_token(amb).unwrap().total_supply, dec("99"));
    }

    #[test]
    fn test_overflowing_fee_cancels_order_with_rejected_transaction() {
        let (coordinator, amb) = coordinator(OrderConfig {
            fee_rate: Decimal::MAX,
            treasury_wallet: Some(900),
        });
        let buyer = funded(&coordinator, 1, amb, "100");

        let order = coordinator
            .place_order(7, buyer, &listing(amb, "5"), 2)
            .unwrap();

        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.transaction_ids.len(), 1);
        let tx = coordinator
            .engine()
            .journal()
            .get(order.transaction_ids[0])
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Rejected);
        assert!(matches!(tx.failure, Some(FailureReason::InvalidRequest(_))));
        assert_eq!(tx.order_id, Some(order.id));
        assert_eq!(
            coordinator.engine().funds().get(buyer).unwrap().balance,
            dec("100")
        );
    }

    #[test]
    fn test_zero_quantity_is_rejected_before_creating_an_order() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "100");

        assert!(matches!(
            coordinator.place_order(7, buyer, &listing(amb, "5"), 0),
            Err(LedgerError::InvalidRequest { .. })
        ));
        assert!(coordinator.orders_of(7).unwrap().is_empty());
    }

    #[test]
    fn test_place_order_for_resolves_wallet() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        funded(&coordinator, 1, amb, "100");
        let wallets: HashMap<PortfolioId, WalletId> = HashMap::from([(7, 1)]);

        let order = coordinator
            .place_order_for(7, amb, &listing(amb, "5"), 1, &wallets)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Completed);

        assert!(matches!(
            coordinator.place_order_for(8, amb, &listing(amb, "5"), 1, &wallets),
            Err(LedgerError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_closed_orders_cannot_be_retried() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "100");
        let completed = coordinator
            .place_order(7, buyer, &listing(amb, "5"), 1)
            .unwrap();

        assert!(matches!(
            coordinator.retry(completed.id),
            Err(LedgerError::InvalidOrderTransition { .. })
        ));
        assert!(matches!(
            coordinator.retry(99),
            Err(LedgerError::OrderNotFound { order: 99 })
        ));
    }

    #[test]
    fn test_orders_of_lists_portfolio_orders() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "100");
        let first = coordinator
            .place_order(7, buyer, &listing(amb, "5"), 1)
            .unwrap();
        let second = coordinator
            .place_order(7, buyer, &listing(amb, "500"), 1)
            .unwrap();
        coordinator
            .place_order(8, buyer, &listing(amb, "5"), 1)
            .unwrap();

        let orders = coordinator.orders_of(7).unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].id, first.id);
        assert_eq!(orders[1].status, OrderStatus::Cancelled);
        assert_eq!(coordinator.find_order(second.id).unwrap(), second);
    }

    fn poison(coordinator: &OrderCoordinator, fund: FundId) {
        let engine = Arc::clone(coordinator.engine());
        let _ = std::thread::spawn(move || {
            let handles = engine.funds().handles(&[fund]).unwrap();
            let _unit = UnitOfWork::acquire(&handles).unwrap();
            panic!("writer crashed while holding the fund lock");
        })
        .join();
    }

    fn heal(coordinator: &OrderCoordinator, fund: FundId) {
        let handles = coordinator.engine().funds().handles(&[fund]).unwrap();
        UnitOfWork::acquire_recovering(&handles).commit();
    }

    #[test]
    fn test_fatal_error_leaves_order_pending_for_retry() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "100");
        poison(&coordinator, buyer);

        let result = coordinator.place_order(7, buyer, &listing(amb, "5"), 1);

        assert!(matches!(result, Err(LedgerError::StorageUnavailable { .. })));
        let pending = coordinator.orders_of(7).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OrderStatus::Pending);
        assert!(pending[0].transaction_ids.is_empty());

        heal(&coordinator, buyer);
        let retried = coordinator.retry(pending[0].id).unwrap();

        assert_eq!(retried.status, OrderStatus::Completed);
        assert_eq!(retried.transaction_ids.len(), 1);
        assert!(coordinator.retry(retried.id).is_err());
    }

    #[test]
    fn test_retry_refuses_order_with_pending_transaction() {
        let (coordinator, amb) = coordinator(OrderConfig::default());
        let buyer = funded(&coordinator, 1, amb, "100");
        poison(&coordinator, buyer);
        assert!(coordinator
            .place_order(7, buyer, &listing(amb, "5"), 1)
            .is_err());
        let order = coordinator.orders_of(7).unwrap().remove(0);
        heal(&coordinator, buyer);

        let market = coordinator.engine().funds().find(500, amb).unwrap();
        let request = TransactionRequest::new(buyer, market, dec("5"), 1, 1).for_order(order.id);
        let in_flight = coordinator.engine().journal().open(&request, dec("5"));

        assert_eq!(
            coordinator.retry(order.id),
            Err(LedgerError::OrderInFlight {
                order: order.id,
                tx: in_flight.id,
                status: TransactionStatus::Pending,
            })
        );
    }
}
