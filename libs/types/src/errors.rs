//! Error taxonomy for the paper-trading engine
//!
//! Every client-visible operation resolves to one of these kinds; internal
//! invariant violations are programming errors and panic instead of
//! appearing here.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::symbol::Symbol;

/// Rejection and failure kinds surfaced to clients.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    #[error("symbol {symbol} is not supported")]
    InvalidSymbol { symbol: String },

    #[error("leverage {leverage}x is not supported")]
    InvalidLeverage { leverage: u32 },

    #[error("quantity must be positive")]
    InvalidQty,

    #[error("limit orders require a price")]
    InvalidPrice,

    #[error("no price available for {symbol} yet")]
    NoPrice { symbol: Symbol },

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },

    #[error("account is liquidated and can no longer trade")]
    AccountLiquidated,

    #[error("no open position in {symbol} to close")]
    NoPosition { symbol: Symbol },

    #[error("{feature} is not supported")]
    Unsupported { feature: &'static str },

    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("persistence failed: {reason}")]
    PersistenceFailed { reason: String },
}

impl TradeError {
    /// Stable machine-readable code for the wire surface.
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::InvalidSymbol { .. } => "INVALID_SYMBOL",
            TradeError::InvalidLeverage { .. } => "INVALID_LEVERAGE",
            TradeError::InvalidQty => "INVALID_QTY",
            TradeError::InvalidPrice => "INVALID_PRICE",
            TradeError::NoPrice { .. } => "NO_PRICE",
            TradeError::InsufficientMargin { .. } => "INSUFFICIENT_MARGIN",
            TradeError::AccountLiquidated => "ACCOUNT_LIQUIDATED",
            TradeError::NoPosition { .. } => "NO_POSITION",
            TradeError::Unsupported { .. } => "UNSUPPORTED",
            TradeError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            TradeError::PersistenceFailed { .. } => "PERSISTENCE_FAILED",
        }
    }

    /// Whether a client can retry the same request later and expect it to
    /// succeed (transient conditions only).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TradeError::NoPrice { .. } | TradeError::UpstreamUnavailable { .. }
        )
    }
}
