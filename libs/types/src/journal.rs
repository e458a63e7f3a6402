//! Journal entries
//!
//! One immutable row per closed (or reduced) position leg, written at fill
//! time. The percentage return is taken against the margin the closed qty
//! had locked, so a 5% move at 10x reads as 50%.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::PortfolioId;
use crate::position::PositionSide;
use crate::symbol::Symbol;

/// Snapshot of one completed trade leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub portfolio_id: PortfolioId,
    pub symbol: Symbol,
    /// Side the position had while open.
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub qty: Decimal,
    pub pnl: Decimal,
    /// Realized PnL relative to the margin locked by the closed qty.
    pub pnl_percent: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

impl JournalEntry {
    /// Build an entry for a leg closed just now.
    #[allow(clippy::too_many_arguments)]
    pub fn for_closed_leg(
        portfolio_id: PortfolioId,
        symbol: Symbol,
        side: PositionSide,
        entry_price: Decimal,
        exit_price: Decimal,
        qty: Decimal,
        pnl: Decimal,
        leverage: u32,
        entry_time: Option<DateTime<Utc>>,
    ) -> Self {
        let exit_time = Utc::now();
        let margin = qty * entry_price / Decimal::from(leverage);
        let pnl_percent = if margin > Decimal::ZERO {
            pnl / margin * dec!(100)
        } else {
            Decimal::ZERO
        };

        Self {
            id: Uuid::now_v7(),
            portfolio_id,
            symbol,
            side,
            entry_price,
            exit_price,
            qty,
            pnl,
            pnl_percent,
            entry_time: entry_time.unwrap_or(exit_time),
            exit_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_percent_against_margin() {
        let entry = JournalEntry::for_closed_leg(
            PortfolioId::new(),
            Symbol::BtcUsdt,
            PositionSide::Long,
            dec!(100000),
            dec!(105000),
            dec!(0.1),
            dec!(500),
            10,
            None,
        );

        // 500 realized on 1000 margin
        assert_eq!(entry.pnl_percent, dec!(50));
        assert_eq!(entry.pnl, dec!(500));
    }

    #[test]
    fn test_short_loss_percent() {
        let entry = JournalEntry::for_closed_leg(
            PortfolioId::new(),
            Symbol::EthUsdt,
            PositionSide::Short,
            dec!(4000),
            dec!(4100),
            dec!(1),
            dec!(-100),
            20,
            None,
        );

        // -100 on 200 margin
        assert_eq!(entry.pnl_percent, dec!(-50));
    }

    #[test]
    fn test_entry_time_falls_back_to_exit_time() {
        let entry = JournalEntry::for_closed_leg(
            PortfolioId::new(),
            Symbol::BtcUsdt,
            PositionSide::Long,
            dec!(100),
            dec!(100),
            dec!(1),
            Decimal::ZERO,
            10,
            None,
        );
        assert_eq!(entry.entry_time, entry.exit_time);
    }
}
