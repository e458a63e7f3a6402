//! The fixed symbol universe
//!
//! The engine trades a closed set of linear USDT-margined pairs. Keeping the
//! universe as an enum makes every per-symbol map dense: a portfolio holds
//! exactly one position per variant and lookups never hit a missing entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported trading pair.
///
/// The canonical form is dash-separated (`BTC-USDT`); the upstream feed uses
/// the concatenated form (`BTCUSDT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Symbol {
    #[serde(rename = "BTC-USDT")]
    BtcUsdt,
    #[serde(rename = "ETH-USDT")]
    EthUsdt,
}

impl Symbol {
    /// Every supported symbol, in deterministic order.
    pub const ALL: [Symbol; 2] = [Symbol::BtcUsdt, Symbol::EthUsdt];

    /// Canonical dash-separated form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Symbol::BtcUsdt => "BTC-USDT",
            Symbol::EthUsdt => "ETH-USDT",
        }
    }

    /// Concatenated form used by the upstream feed.
    pub fn upstream(&self) -> &'static str {
        match self {
            Symbol::BtcUsdt => "BTCUSDT",
            Symbol::EthUsdt => "ETHUSDT",
        }
    }

    /// Resolve an upstream (concatenated) symbol name.
    pub fn from_upstream(s: &str) -> Option<Symbol> {
        Symbol::ALL.into_iter().find(|sym| sym.upstream() == s)
    }
}

impl FromStr for Symbol {
    type Err = UnknownSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::ALL
            .into_iter()
            .find(|sym| sym.as_str() == s)
            .ok_or_else(|| UnknownSymbol(s.to_owned()))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error for a symbol outside the supported universe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown symbol: {0}")]
pub struct UnknownSymbol(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_roundtrip() {
        for sym in Symbol::ALL {
            assert_eq!(sym.as_str().parse::<Symbol>().unwrap(), sym);
        }
    }

    #[test]
    fn test_upstream_mapping() {
        assert_eq!(Symbol::BtcUsdt.upstream(), "BTCUSDT");
        assert_eq!(Symbol::from_upstream("ETHUSDT"), Some(Symbol::EthUsdt));
        assert_eq!(Symbol::from_upstream("SOLUSDT"), None);
    }

    #[test]
    fn test_unsupported_symbol_rejected() {
        let err = "DOGE-USDT".parse::<Symbol>().unwrap_err();
        assert_eq!(err.0, "DOGE-USDT");
    }

    #[test]
    fn test_serialization_uses_canonical_form() {
        let json = serde_json::to_string(&Symbol::BtcUsdt).unwrap();
        assert_eq!(json, "\"BTC-USDT\"");

        let back: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Symbol::BtcUsdt);
    }
}
