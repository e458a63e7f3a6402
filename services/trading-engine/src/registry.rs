//! Portfolio registry
//!
//! Process-wide owner of every in-memory portfolio. All portfolio access
//! (order execution, price-driven revaluation, reads) goes through the
//! registry's single guard, which is what makes operations on one
//! portfolio linearisable: an order and a price tick for the same user
//! apply in some total order, never interleaved halfway.
//!
//! Subscribers receive portfolio events over bounded queues. Enqueues never
//! block: a full queue drops the event (clients render latest-wins), a
//! closed queue unregisters its subscriber.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use types::errors::TradeError;
use types::ids::UserId;
use types::position::PositionSnapshot;
use types::symbol::Symbol;

use crate::config::{self, DEFAULT_LEVERAGE, DEFAULT_STARTING_BALANCE};
use crate::portfolio::{Portfolio, PortfolioSnapshot};
use crate::store::PortfolioStore;

/// Kind of a pushed portfolio event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioEventKind {
    /// State changed because of an order or a price tick.
    #[serde(rename = "portfolio_update")]
    Update,
    /// Full snapshot delivered on (re-)subscription.
    #[serde(rename = "portfolio_snapshot")]
    Snapshot,
}

/// One event pushed to a portfolio subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEvent {
    #[serde(rename = "type")]
    pub kind: PortfolioEventKind,
    pub data: PortfolioSnapshot,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate registry counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_portfolios: usize,
    pub active_portfolios: usize,
    pub liquidated_portfolios: usize,
    pub subscriber_count: usize,
    pub current_prices: BTreeMap<Symbol, Decimal>,
}

struct RegistryInner {
    portfolios: HashMap<UserId, Portfolio>,
    current_prices: BTreeMap<Symbol, Decimal>,
    subscribers: HashMap<UserId, mpsc::Sender<PortfolioEvent>>,
    events_dropped: u64,
}

impl RegistryInner {
    /// Push an event to the user's subscriber, if any. Never blocks.
    fn notify(&mut self, user: UserId, kind: PortfolioEventKind) {
        let Some(snapshot) = self.portfolios.get(&user).map(Portfolio::snapshot) else {
            return;
        };
        let Some(queue) = self.subscribers.get(&user) else {
            return;
        };

        let event = PortfolioEvent {
            kind,
            data: snapshot,
            timestamp: Utc::now(),
        };
        match queue.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Subscriber is lagging; it keeps its slot and catches the
                // next event.
                self.events_dropped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%user, "subscriber disconnected, removing");
                self.subscribers.remove(&user);
            }
        }
    }

    /// Fetch or lazily create a user's portfolio, seeding fresh positions
    /// with the latest known prices.
    fn get_or_create(&mut self, user: UserId, starting_balance: Decimal, leverage: u32) -> &mut Portfolio {
        if !self.portfolios.contains_key(&user) {
            let mut portfolio = Portfolio::new(user, starting_balance, leverage);
            for (&symbol, &price) in &self.current_prices {
                if price > Decimal::ZERO {
                    portfolio.position_mut(symbol).update_price(price);
                }
            }
            info!(%user, %starting_balance, "created portfolio");
            self.portfolios.insert(user, portfolio);
        }
        self.portfolios.get_mut(&user).expect("just inserted")
    }
}

/// Process-wide map of user to portfolio, with price fan-out and
/// subscriber notification.
pub struct PortfolioRegistry {
    inner: Mutex<RegistryInner>,
    store: Option<Arc<PortfolioStore>>,
}

impl PortfolioRegistry {
    pub fn new(store: Option<Arc<PortfolioStore>>) -> Self {
        let current_prices = Symbol::ALL
            .into_iter()
            .map(|symbol| (symbol, Decimal::ZERO))
            .collect();

        Self {
            inner: Mutex::new(RegistryInner {
                portfolios: HashMap::new(),
                current_prices,
                subscribers: HashMap::new(),
                events_dropped: 0,
            }),
            store,
        }
    }

    // -- portfolio lifecycle ----------------------------------------------

    /// Get or lazily create a portfolio with explicit parameters.
    pub async fn get_or_create(
        &self,
        user: UserId,
        starting_balance: Decimal,
        leverage: u32,
    ) -> PortfolioSnapshot {
        let mut inner = self.inner.lock().await;
        inner.get_or_create(user, starting_balance, leverage).snapshot()
    }

    /// Get or lazily create a portfolio with the default parameters.
    pub async fn ensure_portfolio(&self, user: UserId) -> PortfolioSnapshot {
        self.get_or_create(user, DEFAULT_STARTING_BALANCE, DEFAULT_LEVERAGE)
            .await
    }

    pub async fn get_portfolio(&self, user: UserId) -> Option<PortfolioSnapshot> {
        let inner = self.inner.lock().await;
        inner.portfolios.get(&user).map(Portfolio::snapshot)
    }

    pub async fn get_position(&self, user: UserId, symbol: Symbol) -> Option<PositionSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .portfolios
            .get(&user)
            .map(|portfolio| portfolio.position(symbol).snapshot())
    }

    /// Replace a user's portfolio with a fresh one.
    pub async fn reset(&self, user: UserId, starting_balance: Decimal) -> PortfolioSnapshot {
        let mut inner = self.inner.lock().await;
        let leverage = inner
            .portfolios
            .get(&user)
            .map(|portfolio| portfolio.leverage)
            .unwrap_or(DEFAULT_LEVERAGE);
        inner.portfolios.remove(&user);
        let snapshot = inner.get_or_create(user, starting_balance, leverage).snapshot();
        inner.notify(user, PortfolioEventKind::Snapshot);
        info!(%user, "portfolio reset");
        snapshot
    }

    /// Evict a portfolio (and its subscription) from memory.
    pub async fn remove(&self, user: UserId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&user);
        inner.portfolios.remove(&user).is_some()
    }

    /// Change the default leverage for a user's future trades.
    pub async fn update_leverage(&self, user: UserId, leverage: u32) -> Result<(), TradeError> {
        if !config::is_supported_leverage(leverage) {
            return Err(TradeError::InvalidLeverage { leverage });
        }
        let mut inner = self.inner.lock().await;
        inner
            .get_or_create(user, DEFAULT_STARTING_BALANCE, DEFAULT_LEVERAGE)
            .update_leverage(leverage);
        inner.notify(user, PortfolioEventKind::Update);
        Ok(())
    }

    // -- order execution entry point --------------------------------------

    /// Run `f` with mutable access to the user's portfolio and the latest
    /// prices, creating the portfolio on first use.
    ///
    /// The closure executes under the registry guard, so the whole order
    /// pipeline serialises against price ticks for the same user. The
    /// user's subscriber is notified afterwards.
    pub async fn with_portfolio<R>(
        &self,
        user: UserId,
        f: impl FnOnce(&mut Portfolio, &BTreeMap<Symbol, Decimal>) -> R,
    ) -> R {
        let mut inner = self.inner.lock().await;
        let prices = inner.current_prices.clone();
        let portfolio = inner.get_or_create(user, DEFAULT_STARTING_BALANCE, DEFAULT_LEVERAGE);
        let result = f(portfolio, &prices);
        inner.notify(user, PortfolioEventKind::Update);
        result
    }

    // -- price fan-out -----------------------------------------------------

    pub async fn current_price(&self, symbol: Symbol) -> Decimal {
        let inner = self.inner.lock().await;
        inner
            .current_prices
            .get(&symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Apply one price tick. Returns the users whose positions liquidated.
    pub async fn on_price_update(&self, symbol: Symbol, price: Decimal) -> Vec<UserId> {
        self.on_multi_price_update(BTreeMap::from([(symbol, price)]))
            .await
    }

    /// Apply a batch of price ticks. Every active portfolio with an open
    /// position in one of the symbols is revalued and liquidation-checked;
    /// its subscriber receives an update. Returns the liquidated users.
    pub async fn on_multi_price_update(&self, prices: BTreeMap<Symbol, Decimal>) -> Vec<UserId> {
        let mut inner = self.inner.lock().await;
        for (&symbol, &price) in &prices {
            inner.current_prices.insert(symbol, price);
        }

        let mut liquidated_users = Vec::new();
        let mut touched = Vec::new();

        for (&user, portfolio) in inner.portfolios.iter_mut() {
            if !portfolio.is_active {
                continue;
            }
            let holds_any = prices
                .keys()
                .any(|&symbol| portfolio.position(symbol).is_open());
            if !holds_any {
                continue;
            }

            let liquidated_symbols = portfolio.update_prices(&prices);
            if !liquidated_symbols.is_empty() {
                warn!(%user, symbols = ?liquidated_symbols, "positions liquidated");
                liquidated_users.push(user);
            }
            touched.push(user);
        }

        for user in touched {
            inner.notify(user, PortfolioEventKind::Update);
        }

        liquidated_users
    }

    // -- subscriptions -----------------------------------------------------

    /// Register a subscriber queue for a user's portfolio events. The
    /// latest snapshot is delivered immediately when the portfolio exists;
    /// re-subscribing replaces the previous queue.
    pub async fn subscribe(&self, user: UserId, queue: mpsc::Sender<PortfolioEvent>) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.insert(user, queue);
        inner.notify(user, PortfolioEventKind::Snapshot);
        debug!(%user, "subscribed to portfolio events");
    }

    /// Remove a user's subscriber queue. Safe to call repeatedly.
    pub async fn unsubscribe(&self, user: UserId) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&user);
    }

    /// Events dropped because subscriber queues were full.
    pub async fn events_dropped(&self) -> u64 {
        self.inner.lock().await.events_dropped
    }

    // -- storage -----------------------------------------------------------

    /// Write the user's portfolio through to the durable store.
    ///
    /// Best-effort: failures are logged and the in-memory state stands; the
    /// next sync catches up.
    pub async fn sync_to_storage(&self, user: UserId) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = {
            let inner = self.inner.lock().await;
            inner.portfolios.get(&user).map(Portfolio::snapshot)
        };
        let Some(snapshot) = snapshot else {
            return;
        };

        if let Err(err) = store.upsert_portfolio(&snapshot).await {
            warn!(%user, error = %err, "portfolio sync failed");
        } else {
            debug!(%user, "portfolio synced");
        }
    }

    /// Warm-load a portfolio from the durable store into memory.
    pub async fn load_from_storage(&self, user: UserId) -> Option<PortfolioSnapshot> {
        let store = self.store.as_ref()?;
        let stored = match store.load_portfolio(user).await {
            Ok(stored) => stored?,
            Err(err) => {
                warn!(%user, error = %err, "portfolio load failed");
                return None;
            }
        };

        let portfolio = stored.into_portfolio();
        let mut inner = self.inner.lock().await;
        let snapshot = portfolio.snapshot();
        inner.portfolios.insert(user, portfolio);
        info!(%user, "portfolio loaded from storage");
        Some(snapshot)
    }

    // -- stats -------------------------------------------------------------

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            total_portfolios: inner.portfolios.len(),
            active_portfolios: inner
                .portfolios
                .values()
                .filter(|portfolio| portfolio.is_active)
                .count(),
            liquidated_portfolios: inner
                .portfolios
                .values()
                .filter(|portfolio| portfolio.is_liquidated)
                .count(),
            subscriber_count: inner.subscribers.len(),
            current_prices: inner.current_prices.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use types::order::OrderSide;

    fn registry() -> PortfolioRegistry {
        PortfolioRegistry::new(None)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry();
        let user = UserId::new();

        let first = registry.ensure_portfolio(user).await;
        let second = registry.ensure_portfolio(user).await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.balance, DEFAULT_STARTING_BALANCE);

        let stats = registry.stats().await;
        assert_eq!(stats.total_portfolios, 1);
        assert_eq!(stats.active_portfolios, 1);
    }

    #[tokio::test]
    async fn test_new_portfolio_seeded_with_latest_prices() {
        let registry = registry();
        registry.on_price_update(Symbol::BtcUsdt, dec!(100000)).await;

        let user = UserId::new();
        let snapshot = registry.ensure_portfolio(user).await;
        assert_eq!(
            snapshot.positions[&Symbol::BtcUsdt].current_price,
            dec!(100000)
        );
        // No ETH price yet
        assert_eq!(snapshot.positions[&Symbol::EthUsdt].current_price, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_price_update_revalues_open_positions() {
        let registry = registry();
        let user = UserId::new();
        registry.on_price_update(Symbol::BtcUsdt, dec!(100000)).await;

        registry
            .with_portfolio(user, |portfolio, prices| {
                let price = prices[&Symbol::BtcUsdt];
                portfolio.open_position(Symbol::BtcUsdt, OrderSide::Buy, dec!(0.1), price)
            })
            .await
            .unwrap();

        let liquidated = registry.on_price_update(Symbol::BtcUsdt, dec!(105000)).await;
        assert!(liquidated.is_empty());

        let position = registry.get_position(user, Symbol::BtcUsdt).await.unwrap();
        assert_eq!(position.unrealized_pnl, dec!(500.0));
    }

    #[tokio::test]
    async fn test_liquidated_users_reported() {
        let registry = registry();
        let user = UserId::new();
        registry.on_price_update(Symbol::BtcUsdt, dec!(100000)).await;

        registry
            .with_portfolio(user, |portfolio, prices| {
                let price = prices[&Symbol::BtcUsdt];
                portfolio.open_position(Symbol::BtcUsdt, OrderSide::Sell, dec!(0.1), price)
            })
            .await
            .unwrap();

        // Short at 10x liquidates at 109500
        let liquidated = registry.on_price_update(Symbol::BtcUsdt, dec!(110000)).await;
        assert_eq!(liquidated, vec![user]);

        let position = registry.get_position(user, Symbol::BtcUsdt).await.unwrap();
        assert!(!position.is_open);
    }

    #[tokio::test]
    async fn test_subscribe_receives_snapshot_then_updates() {
        let registry = registry();
        let user = UserId::new();
        registry.on_price_update(Symbol::BtcUsdt, dec!(100000)).await;
        registry.ensure_portfolio(user).await;

        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(user, tx).await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.kind, PortfolioEventKind::Snapshot);

        registry
            .with_portfolio(user, |portfolio, prices| {
                let price = prices[&Symbol::BtcUsdt];
                portfolio.open_position(Symbol::BtcUsdt, OrderSide::Buy, dec!(0.1), price)
            })
            .await
            .unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, PortfolioEventKind::Update);
        assert!(update.data.positions[&Symbol::BtcUsdt].is_open);
    }

    #[tokio::test]
    async fn test_full_subscriber_queue_drops_without_blocking() {
        let registry = registry();
        let user = UserId::new();
        registry.on_price_update(Symbol::BtcUsdt, dec!(100000)).await;

        registry
            .with_portfolio(user, |portfolio, prices| {
                let price = prices[&Symbol::BtcUsdt];
                portfolio.open_position(Symbol::BtcUsdt, OrderSide::Buy, dec!(0.01), price)
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        registry.subscribe(user, tx).await;
        // Queue now holds the subscription snapshot and is full

        for i in 0..10 {
            registry
                .on_price_update(Symbol::BtcUsdt, dec!(100000) + Decimal::from(i))
                .await;
        }

        // Producer never blocked; consumer sees a subset
        assert_eq!(rx.recv().await.unwrap().kind, PortfolioEventKind::Snapshot);
        assert!(registry.events_dropped().await > 0);

        // Draining lets the next update through
        let _ = rx.try_recv();
        registry.on_price_update(Symbol::BtcUsdt, dec!(200000)).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_resubscribe_snapshots() {
        let registry = registry();
        let user = UserId::new();
        registry.ensure_portfolio(user).await;

        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(user, tx).await;
        assert_eq!(rx.recv().await.unwrap().kind, PortfolioEventKind::Snapshot);

        registry.unsubscribe(user).await;
        registry.unsubscribe(user).await;

        let (tx2, mut rx2) = mpsc::channel(8);
        registry.subscribe(user, tx2).await;
        let event = rx2.recv().await.unwrap();
        assert_eq!(event.kind, PortfolioEventKind::Snapshot);
    }

    #[tokio::test]
    async fn test_closed_subscriber_removed_on_notify() {
        let registry = registry();
        let user = UserId::new();
        registry.ensure_portfolio(user).await;

        let (tx, rx) = mpsc::channel(8);
        registry.subscribe(user, tx).await;
        drop(rx);

        registry
            .with_portfolio(user, |portfolio, _| portfolio.update_leverage(25))
            .await;

        let stats = registry.stats().await;
        assert_eq!(stats.subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_reset_returns_fresh_portfolio() {
        let registry = registry();
        let user = UserId::new();
        registry.on_price_update(Symbol::BtcUsdt, dec!(100000)).await;

        registry
            .with_portfolio(user, |portfolio, prices| {
                let price = prices[&Symbol::BtcUsdt];
                portfolio.open_position(Symbol::BtcUsdt, OrderSide::Buy, dec!(0.1), price)
            })
            .await
            .unwrap();

        let fresh = registry.reset(user, dec!(25000)).await;
        assert_eq!(fresh.balance, dec!(25000));
        assert!(!fresh.positions[&Symbol::BtcUsdt].is_open);
        // Prices survive the reset
        assert_eq!(
            fresh.positions[&Symbol::BtcUsdt].current_price,
            dec!(100000)
        );
    }

    #[tokio::test]
    async fn test_update_leverage_validation() {
        let registry = registry();
        let user = UserId::new();

        assert!(registry.update_leverage(user, 25).await.is_ok());
        let snapshot = registry.get_portfolio(user).await.unwrap();
        assert_eq!(snapshot.leverage, 25);

        let err = registry.update_leverage(user, 3).await.unwrap_err();
        assert!(matches!(err, TradeError::InvalidLeverage { leverage: 3 }));
    }

    #[tokio::test]
    async fn test_remove_evicts_portfolio() {
        let registry = registry();
        let user = UserId::new();
        registry.ensure_portfolio(user).await;

        assert!(registry.remove(user).await);
        assert!(!registry.remove(user).await);
        assert!(registry.get_portfolio(user).await.is_none());
    }
}
