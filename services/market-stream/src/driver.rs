//! Feed driver descriptors
//!
//! A driver is a plain value describing one upstream feed endpoint pair.
//! Mainnet and testnet differ only in their URLs, so switching environments
//! is a matter of constructing a different value (optionally from the
//! environment), not of picking a different implementation.

/// One upstream feed variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDriver {
    /// Human-readable driver name for logs.
    pub name: &'static str,
    /// Base URL for REST candle queries.
    pub rest_url: String,
    /// Public linear WebSocket URL.
    pub ws_url: String,
    /// Product category sent with every REST query.
    pub category: &'static str,
}

impl FeedDriver {
    /// The production USDT-perpetual feed.
    pub fn bybit_linear() -> Self {
        Self {
            name: "bybit-linear",
            rest_url: "https://api.bybit.com".to_owned(),
            ws_url: "wss://stream.bybit.com/v5/public/linear".to_owned(),
            category: "linear",
        }
    }

    /// The testnet variant of the USDT-perpetual feed.
    pub fn bybit_linear_testnet() -> Self {
        Self {
            name: "bybit-linear-testnet",
            rest_url: "https://api-testnet.bybit.com".to_owned(),
            ws_url: "wss://stream-testnet.bybit.com/v5/public/linear".to_owned(),
            category: "linear",
        }
    }

    /// Override both endpoints, e.g. from the environment or a local stub.
    pub fn with_urls(mut self, rest_url: Option<String>, ws_url: Option<String>) -> Self {
        if let Some(rest) = rest_url {
            self.rest_url = rest;
        }
        if let Some(ws) = ws_url {
            self.ws_url = ws;
        }
        self
    }

    /// Full URL of the kline REST endpoint.
    pub fn kline_endpoint(&self) -> String {
        format!("{}/v5/market/kline", self.rest_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_endpoints() {
        let driver = FeedDriver::bybit_linear();
        assert_eq!(
            driver.kline_endpoint(),
            "https://api.bybit.com/v5/market/kline"
        );
        assert!(driver.ws_url.starts_with("wss://stream.bybit.com"));
    }

    #[test]
    fn test_url_overrides() {
        let driver = FeedDriver::bybit_linear().with_urls(
            Some("http://localhost:9000".to_owned()),
            Some("ws://localhost:9001".to_owned()),
        );
        assert_eq!(driver.kline_endpoint(), "http://localhost:9000/v5/market/kline");
        assert_eq!(driver.ws_url, "ws://localhost:9001");
        // Name and category follow the base variant
        assert_eq!(driver.name, "bybit-linear");
        assert_eq!(driver.category, "linear");
    }
}
