//! Per-user portfolio
//!
//! Wallet-level accounting on top of the per-symbol position state
//! machines: margin checks, fee deduction, the average-price / partial-close
//! / flip order flow, price-driven revaluation, and forced liquidation.
//!
//! A portfolio holds exactly one position per supported symbol (created
//! flat up front), so every lookup is a direct index with no missing-entry
//! branch.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use types::errors::TradeError;
use types::ids::{PortfolioId, UserId};
use types::order::OrderSide;
use types::position::{Position, PositionSide, PositionSnapshot};
use types::symbol::Symbol;

use crate::config::FEE_RATE;

/// One leg of a position that a fill closed, captured before any state was
/// mutated. Feeds journal entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedLeg {
    pub symbol: Symbol,
    /// Side the position had while open.
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub qty: Decimal,
    pub realized_pnl: Decimal,
    pub leverage: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// What one fill did to the portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub filled_qty: Decimal,
    pub fill_price: Decimal,
    pub fee: Decimal,
    /// Present when the fill closed or reduced an existing position.
    pub closed: Option<ClosedLeg>,
}

/// A user's simulated trading account.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub id: PortfolioId,
    pub user_id: UserId,
    pub balance: Decimal,
    pub starting_balance: Decimal,
    /// Default leverage for future opens; open positions keep their own.
    pub leverage: u32,
    pub is_liquidated: bool,
    pub is_active: bool,
    /// Highest equity ever observed, for drawdown reporting.
    pub max_equity_watermark: Decimal,
    positions: BTreeMap<Symbol, Position>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    /// Create a portfolio with a flat position for every supported symbol.
    pub fn new(user_id: UserId, starting_balance: Decimal, leverage: u32) -> Self {
        let now = Utc::now();
        let positions = Symbol::ALL
            .into_iter()
            .map(|symbol| (symbol, Position::flat(symbol, leverage)))
            .collect();

        Self {
            id: PortfolioId::new(),
            user_id,
            balance: starting_balance,
            starting_balance,
            leverage,
            is_liquidated: false,
            is_active: true,
            max_equity_watermark: starting_balance,
            positions,
            created_at: now,
            updated_at: now,
        }
    }

    // -- queries -----------------------------------------------------------

    pub fn position(&self, symbol: Symbol) -> &Position {
        &self.positions[&symbol]
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub(crate) fn position_mut(&mut self, symbol: Symbol) -> &mut Position {
        self.positions.get_mut(&symbol).expect("dense position map")
    }

    /// Replace a position wholesale (warm-load from the durable store).
    pub fn restore_position(&mut self, position: Position) {
        self.positions.insert(position.symbol, position);
    }

    /// Cash balance plus unrealized PnL over open positions.
    pub fn equity(&self) -> Decimal {
        self.balance
            + self
                .positions
                .values()
                .filter(|p| p.is_open())
                .map(|p| p.unrealized_pnl)
                .sum::<Decimal>()
    }

    /// Initial margin locked across open positions.
    pub fn total_margin_used(&self) -> Decimal {
        self.positions.values().map(|p| p.margin_used()).sum()
    }

    /// Margin left for new positions.
    pub fn available_margin(&self) -> Decimal {
        self.equity() - self.total_margin_used()
    }

    /// Used margin over equity; pinned to 1 when equity is gone.
    pub fn margin_ratio(&self) -> Decimal {
        let equity = self.equity();
        if equity <= Decimal::ZERO {
            Decimal::ONE
        } else {
            self.total_margin_used() / equity
        }
    }

    pub fn total_unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Percent below the equity watermark.
    pub fn current_drawdown(&self) -> Decimal {
        if self.max_equity_watermark <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.max_equity_watermark - self.equity()) / self.max_equity_watermark * dec!(100)
    }

    // -- mutations ---------------------------------------------------------

    /// Change the default leverage for future opens. Existing positions
    /// keep the leverage they were opened with.
    pub fn update_leverage(&mut self, leverage: u32) {
        self.leverage = leverage;
        self.updated_at = Utc::now();
    }

    /// Execute a non-reduce-only fill: open, add to, reduce, or flip the
    /// position for `symbol` at `price`.
    ///
    /// The fee is charged once on the full order quantity; the margin check
    /// covers the full quantity as well, using the position's own leverage
    /// when adding to an open same-side position and the portfolio default
    /// otherwise.
    pub fn open_position(
        &mut self,
        symbol: Symbol,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> Result<Execution, TradeError> {
        if self.is_liquidated {
            return Err(TradeError::AccountLiquidated);
        }

        let desired = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let position = self.position(symbol);
        let same_side = position.is_open() && position.side == desired;
        let margin_leverage = if same_side {
            position.leverage
        } else {
            self.leverage
        };

        let required_margin = qty * price / Decimal::from(margin_leverage);
        let fee = qty * price * FEE_RATE;
        let available = self.available_margin();
        if available < required_margin + fee {
            return Err(TradeError::InsufficientMargin {
                required: required_margin + fee,
                available,
            });
        }

        // Fee is debited exactly once per order
        self.balance -= fee;

        let default_leverage = self.leverage;
        let position = self.position_mut(symbol);
        let mut closed = None;

        if !position.is_open() {
            position.open(desired, qty, price, default_leverage);
        } else if same_side {
            position.increase(qty, price);
        } else {
            // Opposite side: capture the closing leg before mutating
            let close_qty = position.qty.min(qty);
            let leg_side = position.side;
            let leg_entry = position.entry_price;
            let leg_leverage = position.leverage;
            let leg_opened_at = position.opened_at;

            let realized = if qty >= position.qty {
                let realized = position.close(price);
                let remaining = qty - close_qty;
                if remaining > Decimal::ZERO {
                    position.open(desired, remaining, price, default_leverage);
                }
                realized
            } else {
                position.reduce(qty, price)
            };

            self.balance += realized;
            closed = Some(ClosedLeg {
                symbol,
                side: leg_side,
                entry_price: leg_entry,
                exit_price: price,
                qty: close_qty,
                realized_pnl: realized,
                leverage: leg_leverage,
                opened_at: leg_opened_at,
            });
        }

        self.update_watermark();
        self.updated_at = Utc::now();

        Ok(Execution {
            filled_qty: qty,
            fill_price: price,
            fee,
            closed,
        })
    }

    /// Close an open position at `price`, fully (`qty = None`) or
    /// partially. The requested quantity clamps to the open quantity, and
    /// the fee is charged on the clamped amount.
    pub fn close_position(
        &mut self,
        symbol: Symbol,
        qty: Option<Decimal>,
        price: Decimal,
    ) -> Result<Execution, TradeError> {
        let position = self.position(symbol);
        if !position.is_open() {
            return Err(TradeError::NoPosition { symbol });
        }

        let close_qty = qty.unwrap_or(position.qty).min(position.qty);
        let fee = close_qty * price * FEE_RATE;

        let leg_side = position.side;
        let leg_entry = position.entry_price;
        let leg_leverage = position.leverage;
        let leg_opened_at = position.opened_at;

        let position = self.position_mut(symbol);
        let realized = if close_qty < position.qty {
            position.reduce(close_qty, price)
        } else {
            position.close(price)
        };

        self.balance += realized - fee;
        self.update_watermark();
        self.updated_at = Utc::now();

        Ok(Execution {
            filled_qty: close_qty,
            fill_price: price,
            fee,
            closed: Some(ClosedLeg {
                symbol,
                side: leg_side,
                entry_price: leg_entry,
                exit_price: price,
                qty: close_qty,
                realized_pnl: realized,
                leverage: leg_leverage,
                opened_at: leg_opened_at,
            }),
        })
    }

    /// Revalue open positions against new prices and force-close any that
    /// breached their liquidation price. Returns the liquidated symbols.
    pub fn update_prices(&mut self, prices: &BTreeMap<Symbol, Decimal>) -> Vec<Symbol> {
        let mut liquidated = Vec::new();

        for (&symbol, &price) in prices {
            let position = self.position_mut(symbol);
            if !position.is_open() {
                continue;
            }
            position.update_price(price);
            if position.check_liquidation() {
                self.liquidate_position(symbol);
                liquidated.push(symbol);
            }
        }

        self.update_watermark();
        if !liquidated.is_empty() {
            self.updated_at = Utc::now();
        }
        liquidated
    }

    /// Force-close one position at its liquidation price, forfeiting the
    /// position's entire initial margin. No exit fee is charged on a forced
    /// close. The account itself liquidates once cash or equity is gone.
    fn liquidate_position(&mut self, symbol: Symbol) {
        let position = self.position_mut(symbol);
        let forfeited = position.margin_used();
        let close_price = position.liquidation_price.unwrap_or(position.current_price);
        position.close(close_price);

        self.balance -= forfeited;

        if self.balance <= Decimal::ZERO || self.equity() <= Decimal::ZERO {
            self.is_liquidated = true;
            self.is_active = false;
        }
    }

    fn update_watermark(&mut self) {
        let equity = self.equity();
        if equity > self.max_equity_watermark {
            self.max_equity_watermark = equity;
        }
    }

    /// Serializable view for API responses and push events.
    pub fn snapshot(&self) -> PortfolioSnapshot {
        PortfolioSnapshot {
            id: self.id,
            user_id: self.user_id,
            balance: self.balance,
            starting_balance: self.starting_balance,
            equity: self.equity(),
            available_margin: self.available_margin(),
            total_margin_used: self.total_margin_used(),
            leverage: self.leverage,
            is_liquidated: self.is_liquidated,
            is_active: self.is_active,
            total_unrealized_pnl: self.total_unrealized_pnl(),
            total_realized_pnl: self.total_realized_pnl(),
            max_equity_watermark: self.max_equity_watermark,
            current_drawdown: self.current_drawdown(),
            positions: self
                .positions
                .iter()
                .map(|(&symbol, position)| (symbol, position.snapshot()))
                .collect(),
        }
    }
}

/// Read-only portfolio view for API responses, push events, and store
/// write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub id: PortfolioId,
    pub user_id: UserId,
    pub balance: Decimal,
    pub starting_balance: Decimal,
    pub equity: Decimal,
    pub available_margin: Decimal,
    pub total_margin_used: Decimal,
    pub leverage: u32,
    pub is_liquidated: bool,
    pub is_active: bool,
    pub total_unrealized_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub max_equity_watermark: Decimal,
    pub current_drawdown: Decimal,
    pub positions: BTreeMap<Symbol, PositionSnapshot>,
}
