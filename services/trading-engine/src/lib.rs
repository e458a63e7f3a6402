//! Trading Engine
//!
//! The in-memory core of the paper-trading service: per-user portfolios,
//! the process-wide registry that fans price ticks out to them, the order
//! execution pipeline, and the write-back to durable storage.
//!
//! # Architecture
//!
//! ```text
//! Market Stream ──► PortfolioRegistry::on_price_update
//!                        │
//!                        ├─► Portfolio::update_prices ─► liquidation checks
//!                        └─► subscriber queues (bounded, drop-on-full)
//!
//! client / queue ──► PaperExchange::submit_order
//!                        │
//!                        ├─► Portfolio::open_position / close_position
//!                        ├─► journal + order rows (one transaction)
//!                        └─► portfolio snapshot broadcast + store sync
//! ```
//!
//! Every mutation of a portfolio happens under the registry guard, so order
//! submissions and price-driven revaluations for the same user are
//! linearisable: an order sees either the pre-tick or the post-tick price,
//! never a half-applied state.

pub mod config;
pub mod exchange;
pub mod portfolio;
pub mod registry;
pub mod store;
pub mod worker;

// Service version constant
pub const SERVICE_VERSION: &str = "0.1.0";
