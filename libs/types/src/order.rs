//! Order lifecycle types
//!
//! Requests are wire-level values: the symbol stays a string until the
//! exchange validates it against the supported universe, and every decimal
//! field serializes as a string so money round-trips exactly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::TradeError;
use crate::ids::{OrderId, PortfolioId};
use crate::position::PositionSnapshot;
use crate::symbol::Symbol;

/// Order side (buyer or seller)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Buy order (bid)
    Buy,
    /// Sell order (ask)
    Sell,
}

impl OrderSide {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order execution style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Fill immediately at the latest price.
    Market,
    /// Fill only when the latest price crosses the limit.
    Limit,
    /// Not implemented.
    Stop,
}

impl Default for OrderType {
    fn default() -> Self {
        OrderType::Market
    }
}

/// Terminal and non-terminal order states recorded durably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Canceled,
}

/// An order as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(default)]
    pub order_type: OrderType,
    pub qty: Decimal,
    /// Limit price; ignored for market orders.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Only decrease the current position, never flip or increase it.
    #[serde(default)]
    pub reduce_only: bool,
    /// Per-order override of the portfolio's default leverage.
    #[serde(default)]
    pub leverage: Option<u32>,
}

/// Outcome of one order submission.
///
/// Rejections carry a machine-readable `error` code next to the
/// human-readable message; fills carry the execution details and the
/// resulting position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub filled_qty: Option<Decimal>,
    #[serde(default)]
    pub fill_price: Option<Decimal>,
    #[serde(default)]
    pub fee: Option<Decimal>,
    #[serde(default)]
    pub position: Option<PositionSnapshot>,
}

impl OrderResult {
    /// A successful fill.
    pub fn filled(
        order_id: OrderId,
        filled_qty: Decimal,
        fill_price: Decimal,
        fee: Decimal,
        position: Option<PositionSnapshot>,
    ) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            message: "order filled".to_owned(),
            error: None,
            filled_qty: Some(filled_qty),
            fill_price: Some(fill_price),
            fee: Some(fee),
            position,
        }
    }

    /// A rejection derived from the error taxonomy.
    pub fn rejected(err: &TradeError) -> Self {
        Self {
            success: false,
            order_id: None,
            message: err.to_string(),
            error: Some(err.code().to_owned()),
            filled_qty: None,
            fill_price: None,
            fee: None,
            position: None,
        }
    }
}

/// Durable record of one order, written on fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub portfolio_id: PortfolioId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{"symbol":"BTC-USDT","side":"BUY","qty":"0.1"}"#;
        let req: OrderRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req.symbol, "BTC-USDT");
        assert_eq!(req.order_type, OrderType::Market);
        assert_eq!(req.qty, dec!(0.1));
        assert_eq!(req.price, None);
        assert!(!req.reduce_only);
        assert_eq!(req.leverage, None);
    }

    #[test]
    fn test_request_full_roundtrip() {
        let req = OrderRequest {
            symbol: "ETH-USDT".to_owned(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            qty: dec!(2.5),
            price: Some(dec!(4000.50)),
            reduce_only: true,
            leverage: Some(20),
        };

        let json = serde_json::to_string(&req).unwrap();
        let back: OrderRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_rejected_result_carries_code() {
        let err = TradeError::InvalidSymbol {
            symbol: "DOGE-USDT".to_owned(),
        };
        let result = OrderResult::rejected(&err);

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("INVALID_SYMBOL"));
        assert!(result.message.contains("DOGE-USDT"));
        assert_eq!(result.order_id, None);
    }

    #[test]
    fn test_filled_result() {
        let result = OrderResult::filled(OrderId::new(), dec!(0.1), dec!(100000), dec!(6), None);

        assert!(result.success);
        assert_eq!(result.fee, Some(dec!(6)));
        assert_eq!(result.error, None);
    }
}
