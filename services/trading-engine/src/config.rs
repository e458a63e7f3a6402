//! Trading configuration
//!
//! The symbol universe, leverage tiers, and fee rate are fixed at compile
//! time; endpoints and operational knobs come from the environment.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

/// Leverage tiers a client may select.
pub const SUPPORTED_LEVERAGE: [u32; 6] = [2, 5, 10, 15, 20, 25];

/// Default leverage for new portfolios.
pub const DEFAULT_LEVERAGE: u32 = 10;

/// Paper balance every new portfolio starts with (USDT).
pub const DEFAULT_STARTING_BALANCE: Decimal = dec!(10000.00);

/// Taker fee charged on every fill (6 basis points).
pub const FEE_RATE: Decimal = dec!(0.0006);

/// Check whether a leverage value is one of the supported tiers.
pub fn is_supported_leverage(leverage: u32) -> bool {
    SUPPORTED_LEVERAGE.contains(&leverage)
}

/// Runtime configuration read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; `None` disables durable persistence.
    pub database_url: Option<String>,
    /// Redis URL for the order intake queue; `None` disables the worker.
    pub redis_url: Option<String>,
    /// Override for the upstream REST base URL.
    pub upstream_rest_url: Option<String>,
    /// Override for the upstream WebSocket URL.
    pub upstream_ws_url: Option<String>,
    /// Back-off between feed reconnect attempts.
    pub feed_reconnect: Duration,
    /// Capacity of subscriber and price-bridge queues.
    pub subscriber_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            upstream_rest_url: std::env::var("UPSTREAM_REST_URL").ok(),
            upstream_ws_url: std::env::var("UPSTREAM_WS_URL").ok(),
            feed_reconnect: Duration::from_secs(
                std::env::var("FEED_RECONNECT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            subscriber_queue_capacity: std::env::var("SUBSCRIBER_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leverage_tiers() {
        for tier in SUPPORTED_LEVERAGE {
            assert!(is_supported_leverage(tier));
        }
        assert!(!is_supported_leverage(1));
        assert!(!is_supported_leverage(50));
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_STARTING_BALANCE, dec!(10000));
        assert_eq!(FEE_RATE * dec!(10000), dec!(6));
        assert!(is_supported_leverage(DEFAULT_LEVERAGE));
    }
}
