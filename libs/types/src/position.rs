//! Per-symbol position state machine
//!
//! A `Position` owns the math of one symbol's exposure for one portfolio:
//! size-weighted average entry, unrealized/realized PnL, the liquidation
//! price, and partial closes. All operations are synchronous and touch only
//! the position's own fields; wallet-level accounting lives in the
//! portfolio that owns the position.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;

/// Residual margin fraction below which a position liquidates.
pub const MAINTENANCE_MARGIN_RATE: Decimal = dec!(0.005);

/// Position side enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    /// Long position - profit when price increases
    Long,
    /// Short position - profit when price decreases
    Short,
    /// No exposure
    Flat,
}

/// Live position state for a single symbol.
///
/// Invariants:
/// - `side == Flat` exactly when `qty == 0`; a flat position has zero entry
///   price, zero unrealized PnL, and no liquidation price.
/// - While open, `liquidation_price` is always defined.
/// - `unrealized_pnl` is recomputed on every price or size mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a flat position for a symbol.
    pub fn flat(symbol: Symbol, leverage: u32) -> Self {
        Self {
            symbol,
            side: PositionSide::Flat,
            qty: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            current_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage,
            liquidation_price: None,
            opened_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.side != PositionSide::Flat && self.qty > Decimal::ZERO
    }

    pub fn is_long(&self) -> bool {
        self.side == PositionSide::Long
    }

    pub fn is_short(&self) -> bool {
        self.side == PositionSide::Short
    }

    /// Notional value at the current price.
    pub fn value(&self) -> Decimal {
        self.qty * self.current_price
    }

    /// Initial margin locked by this position.
    pub fn margin_used(&self) -> Decimal {
        if self.is_open() {
            self.qty * self.entry_price / Decimal::from(self.leverage)
        } else {
            Decimal::ZERO
        }
    }

    /// Unrealized return on the locked margin, in percent.
    pub fn roi_percent(&self) -> Decimal {
        let margin = self.margin_used();
        if margin > Decimal::ZERO {
            self.unrealized_pnl / margin * dec!(100)
        } else {
            Decimal::ZERO
        }
    }

    /// Update the mark price and recompute unrealized PnL.
    pub fn update_price(&mut self, price: Decimal) {
        self.current_price = price;
        self.recalculate_pnl();
    }

    /// Open a fresh position.
    ///
    /// Returns the initial margin `qty * price / leverage`.
    ///
    /// # Panics
    /// Panics if the position is already open, the side is flat, or the
    /// quantity is not positive. All of these are caller bugs.
    pub fn open(
        &mut self,
        side: PositionSide,
        qty: Decimal,
        price: Decimal,
        leverage: u32,
    ) -> Decimal {
        assert!(!self.is_open(), "position already open");
        assert!(side != PositionSide::Flat, "cannot open a flat position");
        assert!(qty > Decimal::ZERO, "open qty must be positive");

        self.side = side;
        self.qty = qty;
        self.entry_price = price;
        self.current_price = price;
        self.leverage = leverage;
        self.opened_at = Some(Utc::now());

        self.recalculate_liquidation_price();
        self.recalculate_pnl();

        self.margin_used()
    }

    /// Add to an open position on the same side.
    ///
    /// The entry price becomes the size-weighted average of the old entry
    /// and the new fill. Returns the additional margin for the added qty.
    ///
    /// # Panics
    /// Panics if the position is not open or the quantity is not positive.
    pub fn increase(&mut self, qty: Decimal, price: Decimal) -> Decimal {
        assert!(self.is_open(), "no open position to increase");
        assert!(qty > Decimal::ZERO, "increase qty must be positive");

        let total_value = self.qty * self.entry_price + qty * price;
        let new_qty = self.qty + qty;
        self.entry_price = total_value / new_qty;
        self.qty = new_qty;

        self.recalculate_liquidation_price();
        self.recalculate_pnl();

        qty * price / Decimal::from(self.leverage)
    }

    /// Partially close an open position, clamping to the open qty.
    ///
    /// Accumulates the realized delta into `realized_pnl` and returns it.
    /// A reduce that consumes the whole position transitions to flat.
    ///
    /// # Panics
    /// Panics if the position is not open.
    pub fn reduce(&mut self, qty: Decimal, price: Decimal) -> Decimal {
        assert!(self.is_open(), "no open position to reduce");

        let qty = qty.min(self.qty);
        if qty == self.qty {
            return self.close(price);
        }

        let portion_pnl = self.signed_delta(price) * qty;
        self.qty -= qty;
        self.realized_pnl += portion_pnl;
        self.recalculate_pnl();

        portion_pnl
    }

    /// Close the entire position, realizing PnL on the remaining qty.
    ///
    /// Returns the realized delta for this final portion; closing an
    /// already-flat position realizes nothing.
    pub fn close(&mut self, price: Decimal) -> Decimal {
        if !self.is_open() {
            return Decimal::ZERO;
        }

        let final_pnl = self.signed_delta(price) * self.qty;
        self.realized_pnl += final_pnl;

        self.qty = Decimal::ZERO;
        self.side = PositionSide::Flat;
        self.entry_price = Decimal::ZERO;
        self.unrealized_pnl = Decimal::ZERO;
        self.liquidation_price = None;
        self.opened_at = None;

        final_pnl
    }

    /// Whether the current price has breached the liquidation price.
    pub fn check_liquidation(&self) -> bool {
        let Some(liq) = self.liquidation_price else {
            return false;
        };
        if !self.is_open() {
            return false;
        }

        if self.is_long() {
            self.current_price <= liq
        } else {
            self.current_price >= liq
        }
    }

    /// Per-unit price delta signed by side.
    fn signed_delta(&self, price: Decimal) -> Decimal {
        let diff = price - self.entry_price;
        if self.is_short() {
            -diff
        } else {
            diff
        }
    }

    fn recalculate_pnl(&mut self) {
        if !self.is_open() {
            self.unrealized_pnl = Decimal::ZERO;
            return;
        }
        self.unrealized_pnl = self.signed_delta(self.current_price) * self.qty;
    }

    /// Bybit-style isolated-margin liquidation price:
    ///
    /// ```text
    /// LONG:  entry * (1 - 1/leverage + maintenance_rate)
    /// SHORT: entry * (1 + 1/leverage - maintenance_rate)
    /// ```
    fn recalculate_liquidation_price(&mut self) {
        if !self.is_open() {
            self.liquidation_price = None;
            return;
        }

        let initial_margin_rate = Decimal::ONE / Decimal::from(self.leverage);
        let liq = if self.is_long() {
            self.entry_price * (Decimal::ONE - initial_margin_rate + MAINTENANCE_MARGIN_RATE)
        } else {
            self.entry_price * (Decimal::ONE + initial_margin_rate - MAINTENANCE_MARGIN_RATE)
        };
        self.liquidation_price = Some(liq);
    }

    /// Serializable snapshot with the derived fields clients expect.
    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            symbol: self.symbol,
            side: self.side,
            qty: self.qty,
            entry_price: self.entry_price,
            current_price: self.current_price,
            unrealized_pnl: self.unrealized_pnl,
            realized_pnl: self.realized_pnl,
            leverage: self.leverage,
            liquidation_price: self.liquidation_price,
            margin_used: self.margin_used(),
            roi_percent: self.roi_percent(),
            is_open: self.is_open(),
        }
    }
}

/// Read-only position view for API responses and push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Option<Decimal>,
    pub margin_used: Decimal,
    pub roi_percent: Decimal,
    pub is_open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn long_btc(qty: Decimal, price: Decimal, leverage: u32) -> Position {
        let mut pos = Position::flat(Symbol::BtcUsdt, leverage);
        pos.open(PositionSide::Long, qty, price, leverage);
        pos
    }

    #[test]
    fn test_open_returns_initial_margin() {
        let mut pos = Position::flat(Symbol::BtcUsdt, 10);
        let margin = pos.open(PositionSide::Long, dec!(0.1), dec!(100000), 10);

        assert_eq!(margin, dec!(1000));
        assert_eq!(pos.entry_price, dec!(100000));
        assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
        assert!(pos.is_open());
        assert!(pos.opened_at.is_some());
    }

    #[test]
    #[should_panic(expected = "position already open")]
    fn test_open_twice_panics() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        pos.open(PositionSide::Long, dec!(0.1), dec!(100000), 10);
    }

    #[test]
    fn test_long_liquidation_price() {
        // 100 * (1 - 0.1 + 0.005) = 90.5 at 10x
        let pos = long_btc(dec!(1), dec!(100), 10);
        assert_eq!(pos.liquidation_price, Some(dec!(90.500)));
    }

    #[test]
    fn test_short_liquidation_price() {
        // 100 * (1 + 0.05 - 0.005) = 104.5 at 20x
        let mut pos = Position::flat(Symbol::BtcUsdt, 20);
        pos.open(PositionSide::Short, dec!(1), dec!(100), 20);
        assert_eq!(pos.liquidation_price, Some(dec!(104.500)));
    }

    #[test]
    fn test_update_price_recomputes_pnl() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        pos.update_price(dec!(105000));
        assert_eq!(pos.unrealized_pnl, dec!(500.0));

        pos.update_price(dec!(95000));
        assert_eq!(pos.unrealized_pnl, dec!(-500.0));
    }

    #[test]
    fn test_short_pnl_sign() {
        let mut pos = Position::flat(Symbol::EthUsdt, 10);
        pos.open(PositionSide::Short, dec!(2), dec!(4000), 10);

        pos.update_price(dec!(3900));
        assert_eq!(pos.unrealized_pnl, dec!(200));

        pos.update_price(dec!(4100));
        assert_eq!(pos.unrealized_pnl, dec!(-200));
    }

    #[test]
    fn test_increase_uses_weighted_average_entry() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        let margin = pos.increase(dec!(0.1), dec!(110000));

        // (0.1*100000 + 0.1*110000) / 0.2 = 105000
        assert_eq!(pos.entry_price, dec!(105000));
        assert_eq!(pos.qty, dec!(0.2));
        assert_eq!(margin, dec!(1100));
        // Liquidation follows the new entry
        assert_eq!(pos.liquidation_price, Some(dec!(105000) * dec!(0.905)));
    }

    #[test]
    fn test_reduce_realizes_portion() {
        let mut pos = long_btc(dec!(0.2), dec!(100000), 10);
        pos.update_price(dec!(102000));

        let realized = pos.reduce(dec!(0.05), dec!(102000));
        assert_eq!(realized, dec!(100.00));
        assert_eq!(pos.qty, dec!(0.15));
        assert_eq!(pos.realized_pnl, dec!(100.00));
        // Remainder still marked at 102000
        assert_eq!(pos.unrealized_pnl, dec!(300.00));
    }

    #[test]
    fn test_reduce_clamps_to_open_qty() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        let realized = pos.reduce(dec!(0.5), dec!(101000));

        assert_eq!(realized, dec!(100.0));
        assert!(!pos.is_open());
        assert_eq!(pos.qty, Decimal::ZERO);
    }

    #[test]
    fn test_close_resets_to_flat() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        let realized = pos.close(dec!(105000));

        assert_eq!(realized, dec!(500.0));
        assert_eq!(pos.side, PositionSide::Flat);
        assert_eq!(pos.entry_price, Decimal::ZERO);
        assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
        assert_eq!(pos.liquidation_price, None);
        assert_eq!(pos.opened_at, None);

        // Closing again is a no-op
        assert_eq!(pos.close(dec!(200000)), Decimal::ZERO);
    }

    #[test]
    fn test_check_liquidation_long() {
        let mut pos = long_btc(dec!(1), dec!(100), 10);

        pos.update_price(dec!(90.51));
        assert!(!pos.check_liquidation());

        pos.update_price(dec!(90.5));
        assert!(pos.check_liquidation());
    }

    #[test]
    fn test_check_liquidation_short() {
        let mut pos = Position::flat(Symbol::BtcUsdt, 20);
        pos.open(PositionSide::Short, dec!(1), dec!(100), 20);

        pos.update_price(dec!(104.49));
        assert!(!pos.check_liquidation());

        pos.update_price(dec!(104.5));
        assert!(pos.check_liquidation());
    }

    #[test]
    fn test_roi_percent() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        pos.update_price(dec!(105000));
        // 500 profit on 1000 margin
        assert_eq!(pos.roi_percent(), dec!(50));
    }

    #[test]
    fn test_snapshot_mirrors_state() {
        let mut pos = long_btc(dec!(0.1), dec!(100000), 10);
        pos.update_price(dec!(104000));

        let snap = pos.snapshot();
        assert_eq!(snap.qty, dec!(0.1));
        assert_eq!(snap.margin_used, dec!(1000));
        assert_eq!(snap.unrealized_pnl, dec!(400.0));
        assert!(snap.is_open);
    }

    proptest! {
        /// Realized plus unrealized PnL always equals the sum over fills of
        /// (price - entry) weighted by qty and side, for any sequence of
        /// increases, reductions, and price moves.
        #[test]
        fn prop_pnl_conservation(
            qty_units in 1u32..500,
            entry_units in 1u32..1_000_000,
            moves in proptest::collection::vec((1u32..1_000_000, 1u32..500), 1..8),
        ) {
            let qty = Decimal::from(qty_units) / dec!(100);
            let entry = Decimal::from(entry_units);

            let mut pos = Position::flat(Symbol::BtcUsdt, 10);
            pos.open(PositionSide::Long, qty, entry, 10);

            let mut expected_realized = Decimal::ZERO;
            for (price_units, reduce_units) in moves {
                if !pos.is_open() {
                    break;
                }
                let price = Decimal::from(price_units);
                pos.update_price(price);

                let reduce_qty = (Decimal::from(reduce_units) / dec!(1000)).min(pos.qty);
                if reduce_qty > Decimal::ZERO {
                    expected_realized += (price - pos.entry_price) * reduce_qty.min(pos.qty);
                    pos.reduce(reduce_qty, price);
                }
            }

            prop_assert_eq!(pos.realized_pnl, expected_realized);
            if pos.is_open() {
                let expected_unrealized = (pos.current_price - pos.entry_price) * pos.qty;
                prop_assert_eq!(pos.unrealized_pnl, expected_unrealized);
            } else {
                prop_assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
            }
        }
    }
}
