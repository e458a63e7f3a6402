//! Market Stream Service
//!
//! Maintains an outbound connection to the upstream price feed, decodes
//! candle messages, and delivers them to internal consumers keyed by
//! `(symbol, interval)`.
//!
//! # Architecture
//!
//! ```text
//! Upstream WebSocket ──► MarketStream ──► per-key consumer queues
//!                          │                (bounded, drop-on-full)
//! Upstream REST ───────────┘
//!   (historical backfill, ATH/ATL seeding)
//! ```
//!
//! Connection loss triggers a fixed back-off and retry, indefinitely;
//! active subscriptions are re-issued on every reconnect. Consumers never
//! block the feed: a full queue drops the event for that consumer.

pub mod backfill;
pub mod driver;
pub mod stream;

pub use backfill::{fetch_extremes, fetch_klines, fetch_klines_paginated};
pub use driver::FeedDriver;
pub use stream::{MarketStream, PriceExtremes, StreamConfig, StreamError};

// Library version constant
pub const SERVICE_VERSION: &str = "0.1.0";
