//! Composition root for the paper-trading engine
//!
//! Owns the long-lived values (store, registry, exchange, market stream)
//! and wires them together: candle closes from the stream drive portfolio
//! revaluation, and the optional queue worker feeds orders to the exchange.

use std::sync::Arc;

use market_stream::{FeedDriver, MarketStream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use types::candle::Interval;
use types::symbol::Symbol;

use trading_engine::config::Config;
use trading_engine::exchange::PaperExchange;
use trading_engine::registry::PortfolioRegistry;
use trading_engine::store::PortfolioStore;
use trading_engine::{worker, SERVICE_VERSION};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env();
    info!(version = SERVICE_VERSION, "starting trading engine");

    let store = match &config.database_url {
        Some(url) => match PortfolioStore::connect_lazy(url) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(error = %err, "invalid DATABASE_URL; running without durable store");
                None
            }
        },
        None => {
            warn!("DATABASE_URL not set; running without durable store");
            None
        }
    };

    let registry = Arc::new(PortfolioRegistry::new(store.clone()));
    let exchange = Arc::new(PaperExchange::new(registry.clone(), store));

    let driver = FeedDriver::bybit_linear().with_urls(
        config.upstream_rest_url.clone(),
        config.upstream_ws_url.clone(),
    );
    let stream = Arc::new(MarketStream::new(
        driver,
        StreamConfig {
            reconnect_interval: config.feed_reconnect,
            ..StreamConfig::default()
        },
    ));

    // Bridge candle closes into portfolio revaluation, one task per symbol
    for symbol in Symbol::ALL {
        let (tx, mut rx) = mpsc::channel(config.subscriber_queue_capacity);
        stream.subscribe(symbol, Interval::Min1, tx).await;

        let registry = registry.clone();
        tokio::spawn(async move {
            while let Some(candle) = rx.recv().await {
                let liquidated = registry.on_price_update(symbol, candle.close).await;
                for user in liquidated {
                    registry.sync_to_storage(user).await;
                }
            }
        });
    }

    // Upstream feed connection, reconnecting forever
    {
        let stream = stream.clone();
        tokio::spawn(async move { stream.run().await });
    }

    // Optional order intake from the queue
    match config.redis_url.clone() {
        Some(redis_url) => {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                if let Err(err) = worker::run_order_worker(&redis_url, exchange).await {
                    error!(error = %err, "order worker exited");
                }
            });
        }
        None => info!("REDIS_URL not set; order queue worker disabled"),
    }

    info!("trading engine running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
