//! Durable store adapter
//!
//! Write-side: order and journal rows on fills (one transaction per fill)
//! and opportunistic portfolio write-through. Read-side: warm-loading a
//! portfolio and its positions. Schema migrations are owned elsewhere; the
//! engine assumes text-encoded enum columns, `NUMERIC` money columns, and a
//! unique index on `positions (portfolio_id, symbol)`.
//!
//! The pool connects lazily, so the engine starts (and keeps trading) even
//! when the database is down; every failed write is logged by the caller
//! and retried by the next sync.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use types::ids::{PortfolioId, UserId};
use types::journal::JournalEntry;
use types::order::{OrderRecord, OrderSide, OrderStatus, OrderType};
use types::position::{Position, PositionSide};
use types::symbol::Symbol;
use uuid::Uuid;

use crate::portfolio::{Portfolio, PortfolioSnapshot};

/// Postgres-backed store for orders, journal entries, and portfolios.
pub struct PortfolioStore {
    pool: PgPool,
}

impl PortfolioStore {
    /// Create a store over a lazily-connecting pool.
    pub fn connect_lazy(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist one fill: the order row and, when a leg closed, its journal
    /// entry, committed together.
    pub async fn record_fill(
        &self,
        order: &OrderRecord,
        journal: Option<&JournalEntry>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO orders \
             (id, portfolio_id, symbol, side, order_type, qty, price, filled_qty, \
              avg_fill_price, status, reduce_only, created_at, filled_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(order.id.as_uuid())
        .bind(order.portfolio_id.as_uuid())
        .bind(order.symbol.as_str())
        .bind(order_side_str(order.side))
        .bind(order_type_str(order.order_type))
        .bind(order.qty)
        .bind(order.price)
        .bind(order.filled_qty)
        .bind(order.avg_fill_price)
        .bind(order_status_str(order.status))
        .bind(order.reduce_only)
        .bind(order.created_at)
        .bind(order.filled_at)
        .execute(&mut *tx)
        .await?;

        if let Some(entry) = journal {
            sqlx::query(
                "INSERT INTO journal_entries \
                 (id, portfolio_id, symbol, side, entry_price, exit_price, qty, \
                  pnl, pnl_percent, entry_time, exit_time) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(entry.id)
            .bind(entry.portfolio_id.as_uuid())
            .bind(entry.symbol.as_str())
            .bind(position_side_str(entry.side))
            .bind(entry.entry_price)
            .bind(entry.exit_price)
            .bind(entry.qty)
            .bind(entry.pnl)
            .bind(entry.pnl_percent)
            .bind(entry.entry_time)
            .bind(entry.exit_time)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    /// Write a portfolio and its positions through to the store.
    pub async fn upsert_portfolio(&self, snapshot: &PortfolioSnapshot) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO portfolios \
             (id, user_id, balance, starting_balance, leverage, \
              max_drawdown_watermark, is_liquidated, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (user_id) DO UPDATE SET \
               balance = EXCLUDED.balance, \
               leverage = EXCLUDED.leverage, \
               max_drawdown_watermark = EXCLUDED.max_drawdown_watermark, \
               is_liquidated = EXCLUDED.is_liquidated, \
               is_active = EXCLUDED.is_active",
        )
        .bind(snapshot.id.as_uuid())
        .bind(snapshot.user_id.as_uuid())
        .bind(snapshot.balance)
        .bind(snapshot.starting_balance)
        .bind(snapshot.leverage as i32)
        .bind(snapshot.max_equity_watermark)
        .bind(snapshot.is_liquidated)
        .bind(snapshot.is_active)
        .execute(&mut *tx)
        .await?;

        for position in snapshot.positions.values() {
            sqlx::query(
                "INSERT INTO positions \
                 (id, portfolio_id, symbol, side, qty, entry_price, current_price, \
                  unrealized_pnl, realized_pnl, liquidation_price, leverage, is_open) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (portfolio_id, symbol) DO UPDATE SET \
                   side = EXCLUDED.side, \
                   qty = EXCLUDED.qty, \
                   entry_price = EXCLUDED.entry_price, \
                   current_price = EXCLUDED.current_price, \
                   unrealized_pnl = EXCLUDED.unrealized_pnl, \
                   realized_pnl = EXCLUDED.realized_pnl, \
                   liquidation_price = EXCLUDED.liquidation_price, \
                   leverage = EXCLUDED.leverage, \
                   is_open = EXCLUDED.is_open",
            )
            .bind(Uuid::now_v7())
            .bind(snapshot.id.as_uuid())
            .bind(position.symbol.as_str())
            .bind(position_side_str(position.side))
            .bind(position.qty)
            .bind(position.entry_price)
            .bind(position.current_price)
            .bind(position.unrealized_pnl)
            .bind(position.realized_pnl)
            .bind(position.liquidation_price)
            .bind(position.leverage as i32)
            .bind(position.is_open)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    /// Read a portfolio and its positions for warm-loading.
    pub async fn load_portfolio(&self, user: UserId) -> Result<Option<StoredPortfolio>, sqlx::Error> {
        let row: Option<PortfolioRow> = sqlx::query_as(
            "SELECT id, user_id, balance, starting_balance, leverage, \
                    max_drawdown_watermark, is_liquidated, is_active \
             FROM portfolios WHERE user_id = $1",
        )
        .bind(user.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let positions: Vec<PositionRow> = sqlx::query_as(
            "SELECT symbol, side, qty, entry_price, current_price, unrealized_pnl, \
                    realized_pnl, liquidation_price, leverage, is_open, opened_at \
             FROM positions WHERE portfolio_id = $1",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(StoredPortfolio { row, positions }))
    }
}

fn order_side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Stop => "STOP",
    }
}

fn order_status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Open => "OPEN",
        OrderStatus::Filled => "FILLED",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Canceled => "CANCELED",
    }
}

fn position_side_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "LONG",
        PositionSide::Short => "SHORT",
        PositionSide::Flat => "FLAT",
    }
}

fn position_side_from_str(side: &str) -> PositionSide {
    match side {
        "LONG" => PositionSide::Long,
        "SHORT" => PositionSide::Short,
        _ => PositionSide::Flat,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PortfolioRow {
    id: Uuid,
    user_id: Uuid,
    balance: Decimal,
    starting_balance: Decimal,
    leverage: i32,
    max_drawdown_watermark: Decimal,
    is_liquidated: bool,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PositionRow {
    symbol: String,
    side: String,
    qty: Decimal,
    entry_price: Option<Decimal>,
    current_price: Option<Decimal>,
    unrealized_pnl: Decimal,
    realized_pnl: Decimal,
    liquidation_price: Option<Decimal>,
    leverage: i32,
    is_open: bool,
    opened_at: Option<DateTime<Utc>>,
}

/// A portfolio as read back from the store.
pub struct StoredPortfolio {
    row: PortfolioRow,
    positions: Vec<PositionRow>,
}

impl StoredPortfolio {
    /// Rebuild the in-memory portfolio. Position rows for symbols outside
    /// the supported universe are skipped.
    pub fn into_portfolio(self) -> Portfolio {
        let user = UserId::from_uuid(self.row.user_id);
        let mut portfolio = Portfolio::new(
            user,
            self.row.starting_balance,
            self.row.leverage.max(1) as u32,
        );
        portfolio.id = PortfolioId::from_uuid(self.row.id);
        portfolio.balance = self.row.balance;
        portfolio.max_equity_watermark = self.row.max_drawdown_watermark;
        portfolio.is_liquidated = self.row.is_liquidated;
        portfolio.is_active = self.row.is_active;

        for row in self.positions {
            let Ok(symbol) = Symbol::from_str(&row.symbol) else {
                continue;
            };
            let mut position = Position::flat(symbol, row.leverage.max(1) as u32);
            if row.is_open {
                position.side = position_side_from_str(&row.side);
                position.qty = row.qty;
                position.entry_price = row.entry_price.unwrap_or(Decimal::ZERO);
                position.current_price = row.current_price.unwrap_or(Decimal::ZERO);
                position.unrealized_pnl = row.unrealized_pnl;
                position.liquidation_price = row.liquidation_price;
                position.opened_at = row.opened_at;
            }
            position.realized_pnl = row.realized_pnl;
            portfolio.restore_position(position);
        }

        portfolio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn portfolio_row() -> PortfolioRow {
        PortfolioRow {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            balance: dec!(9876.54),
            starting_balance: dec!(10000),
            leverage: 15,
            max_drawdown_watermark: dec!(10100),
            is_liquidated: false,
            is_active: true,
        }
    }

    #[test]
    fn test_enum_column_encoding() {
        assert_eq!(order_side_str(OrderSide::Buy), "BUY");
        assert_eq!(order_type_str(OrderType::Market), "MARKET");
        assert_eq!(order_status_str(OrderStatus::Filled), "FILLED");
        assert_eq!(position_side_str(PositionSide::Short), "SHORT");
        assert_eq!(position_side_from_str("LONG"), PositionSide::Long);
        assert_eq!(position_side_from_str("garbage"), PositionSide::Flat);
    }

    #[test]
    fn test_stored_portfolio_rebuild() {
        let row = portfolio_row();
        let user_id = row.user_id;
        let stored = StoredPortfolio {
            row,
            positions: vec![PositionRow {
                symbol: "BTC-USDT".to_owned(),
                side: "LONG".to_owned(),
                qty: dec!(0.25),
                entry_price: Some(dec!(100000)),
                current_price: Some(dec!(101000)),
                unrealized_pnl: dec!(250),
                realized_pnl: dec!(42),
                liquidation_price: Some(dec!(90500)),
                leverage: 10,
                is_open: true,
                opened_at: Some(Utc::now()),
            }],
        };

        let portfolio = stored.into_portfolio();
        assert_eq!(*portfolio.user_id.as_uuid(), user_id);
        assert_eq!(portfolio.balance, dec!(9876.54));
        assert_eq!(portfolio.leverage, 15);
        assert_eq!(portfolio.max_equity_watermark, dec!(10100));

        let position = portfolio.position(Symbol::BtcUsdt);
        assert!(position.is_open());
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.qty, dec!(0.25));
        assert_eq!(position.entry_price, dec!(100000));
        assert_eq!(position.realized_pnl, dec!(42));
        assert_eq!(position.leverage, 10);

        // The other symbol stays flat and dense
        assert!(!portfolio.position(Symbol::EthUsdt).is_open());
    }

    #[test]
    fn test_unknown_symbol_rows_skipped() {
        let stored = StoredPortfolio {
            row: portfolio_row(),
            positions: vec![PositionRow {
                symbol: "DOGE-USDT".to_owned(),
                side: "LONG".to_owned(),
                qty: dec!(1000),
                entry_price: Some(dec!(0.1)),
                current_price: None,
                unrealized_pnl: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                liquidation_price: None,
                leverage: 10,
                is_open: true,
                opened_at: None,
            }],
        };

        let portfolio = stored.into_portfolio();
        for symbol in Symbol::ALL {
            assert!(!portfolio.position(symbol).is_open());
        }
    }
}
