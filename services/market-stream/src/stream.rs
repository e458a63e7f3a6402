//! Upstream WebSocket stream and candle fan-out
//!
//! One `MarketStream` owns the connection to the upstream feed, the set of
//! upstream topic subscriptions, and the per-key consumer queues. The
//! connection task reconnects forever with a fixed back-off and re-issues
//! every recorded subscription after each reconnect.
//!
//! Fan-out never blocks: consumer queues are bounded and a full queue drops
//! the candle for that consumer (latest-wins display semantics). A closed
//! queue unregisters its consumer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use types::candle::{Candle, Interval, StreamKey};
use types::symbol::Symbol;

use crate::backfill;
use crate::driver::FeedDriver;

/// Errors from the upstream connection and REST fetches.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream rejected request: {reason}")]
    Upstream { reason: String },

    #[error("websocket transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Surface stream failures to clients as the retriable upstream kind.
impl From<StreamError> for types::errors::TradeError {
    fn from(err: StreamError) -> Self {
        types::errors::TradeError::UpstreamUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Runtime knobs for the stream service.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Back-off between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Deadline for REST fetches (backfill, extremes).
    pub request_timeout: Duration,
    /// Interval subscribed for every supported symbol at startup.
    pub default_interval: Interval,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            default_interval: Interval::Min1,
        }
    }
}

/// Sampled all-time price extremes for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceExtremes {
    pub ath: Option<Decimal>,
    pub atl: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// State guarded by the stream's own mutex.
struct StreamInner {
    /// Consumer queues per subscription key.
    subscribers: HashMap<StreamKey, Vec<mpsc::Sender<Candle>>>,
    /// Latest candle per key, delivered immediately to new subscribers.
    latest: HashMap<StreamKey, Candle>,
    /// Upstream topics to hold open, re-issued on every reconnect.
    upstream_topics: BTreeSet<String>,
    /// Sampled extremes per symbol.
    extremes: BTreeMap<Symbol, PriceExtremes>,
    /// Candles dropped because a consumer queue was full.
    candles_dropped: u64,
}

/// Upstream market stream with topic-keyed fan-out.
pub struct MarketStream {
    driver: FeedDriver,
    config: StreamConfig,
    http: reqwest::Client,
    inner: Mutex<StreamInner>,
    /// Topics queued for subscription while a connection is live.
    pending_tx: mpsc::UnboundedSender<String>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MarketStream {
    pub fn new(driver: FeedDriver, config: StreamConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client");
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        Self {
            driver,
            config,
            http,
            inner: Mutex::new(StreamInner {
                subscribers: HashMap::new(),
                latest: HashMap::new(),
                upstream_topics: BTreeSet::new(),
                extremes: BTreeMap::new(),
                candles_dropped: 0,
            }),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
        }
    }

    /// The REST client used for backfill, sharing the stream's deadline.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn driver(&self) -> &FeedDriver {
        &self.driver
    }

    /// Run the stream: seed extremes, then connect and reconnect forever.
    pub async fn run(&self) {
        self.seed_extremes().await;

        loop {
            info!(driver = self.driver.name, url = %self.driver.ws_url, "connecting to upstream feed");
            match self.connect_once().await {
                Ok(()) => info!("upstream connection closed"),
                Err(err) => warn!(error = %err, "upstream connection error"),
            }
            tokio::time::sleep(self.config.reconnect_interval).await;
        }
    }

    /// Register a consumer queue for one `(symbol, interval)` stream.
    ///
    /// The latest cached candle for the key, if any, is delivered
    /// immediately. The first subscription to a new key also opens the
    /// upstream topic.
    pub async fn subscribe(&self, symbol: Symbol, interval: Interval, queue: mpsc::Sender<Candle>) {
        let key = StreamKey::new(symbol, interval);
        let topic = upstream_topic(symbol, interval);
        let mut inner = self.inner.lock().await;

        if let Some(candle) = inner.latest.get(&key) {
            let _ = queue.try_send(candle.clone());
        }

        inner.subscribers.entry(key).or_default().push(queue);
        if inner.upstream_topics.insert(topic.clone()) {
            // New topic: ask the connection task to subscribe now; a
            // reconnect would pick it up from `upstream_topics` anyway.
            let _ = self.pending_tx.send(topic);
        }
        debug!(key = %key, "consumer subscribed");
    }

    /// Remove a consumer queue from a stream. Unsubscribing a queue that
    /// was never registered (or already removed) is a no-op.
    pub async fn unsubscribe(&self, symbol: Symbol, interval: Interval, queue: &mpsc::Sender<Candle>) {
        let key = StreamKey::new(symbol, interval);
        let mut inner = self.inner.lock().await;
        if let Some(queues) = inner.subscribers.get_mut(&key) {
            queues.retain(|existing| !existing.same_channel(queue));
            debug!(key = %key, "consumer unsubscribed");
        }
    }

    /// Sampled all-time extremes for a symbol.
    pub async fn extremes(&self, symbol: Symbol) -> PriceExtremes {
        self.inner
            .lock()
            .await
            .extremes
            .get(&symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Total candles dropped across all full consumer queues.
    pub async fn candles_dropped(&self) -> u64 {
        self.inner.lock().await.candles_dropped
    }

    /// Sample ATH/ATL for every supported symbol from weekly candles.
    pub async fn seed_extremes(&self) {
        for symbol in Symbol::ALL {
            let extremes = backfill::fetch_extremes(&self.http, &self.driver, symbol).await;
            if let (Some(ath), Some(atl)) = (extremes.ath, extremes.atl) {
                info!(symbol = %symbol, %ath, %atl, "seeded price extremes");
            }
            self.inner.lock().await.extremes.insert(symbol, extremes);
        }
    }

    /// One connection lifetime: subscribe, then pump messages until the
    /// socket closes or errors.
    async fn connect_once(&self) -> Result<(), StreamError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.driver.ws_url.as_str()).await?;
        let (mut write, mut read) = ws.split();
        info!(driver = self.driver.name, "connected to upstream feed");

        // Default streams plus everything consumers asked for so far
        let topics: BTreeSet<String> = {
            let inner = self.inner.lock().await;
            Symbol::ALL
                .into_iter()
                .map(|symbol| upstream_topic(symbol, self.config.default_interval))
                .chain(inner.upstream_topics.iter().cloned())
                .collect()
        };
        for topic in &topics {
            write.send(Message::Text(subscribe_frame(topic))).await?;
            debug!(topic = %topic, "subscribed upstream");
        }

        let mut pending = self.pending_rx.lock().await;
        loop {
            tokio::select! {
                topic = pending.recv() => {
                    // The sender half lives as long as self, so this is
                    // always Some.
                    if let Some(topic) = topic {
                        write.send(Message::Text(subscribe_frame(&topic))).await?;
                        debug!(topic = %topic, "subscribed upstream");
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }

    /// Decode one inbound frame; anything that is not a kline push
    /// (subscription acks, heartbeats) is ignored.
    async fn handle_message(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                warn!(bytes = text.len(), "invalid JSON from upstream");
                return;
            }
        };

        let Some(topic) = value.get("topic").and_then(|t| t.as_str()) else {
            return;
        };
        let Some(key) = parse_topic(topic) else {
            // Unsupported symbol or interval: silently ignored
            return;
        };

        let klines: Vec<WsKline> = match value
            .get("data")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(klines)) => klines,
            _ => {
                warn!(topic = %topic, "malformed kline payload");
                return;
            }
        };

        for kline in klines {
            let candle = kline.into_candle(key);
            self.broadcast(key, candle).await;
        }
    }

    /// Cache the candle and fan it out to every consumer of its key.
    async fn broadcast(&self, key: StreamKey, candle: Candle) {
        let mut inner = self.inner.lock().await;
        inner.latest.insert(key, candle.clone());

        let mut dropped = 0u64;
        if let Some(queues) = inner.subscribers.get_mut(&key) {
            queues.retain(|queue| match queue.try_send(candle.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Consumer is lagging; it keeps its slot and catches the
                    // next candle.
                    dropped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        inner.candles_dropped += dropped;
    }
}

/// Upstream topic name for one stream key.
fn upstream_topic(symbol: Symbol, interval: Interval) -> String {
    format!("kline.{}.{}", interval.code(), symbol.upstream())
}

/// Subscription frame for one topic.
fn subscribe_frame(topic: &str) -> String {
    serde_json::json!({ "op": "subscribe", "args": [topic] }).to_string()
}

/// Parse `kline.<interval>.<symbol>` into a stream key.
fn parse_topic(topic: &str) -> Option<StreamKey> {
    let mut parts = topic.split('.');
    if parts.next()? != "kline" {
        return None;
    }
    let interval = Interval::from_code(parts.next()?)?;
    let symbol = Symbol::from_upstream(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(StreamKey::new(symbol, interval))
}

/// One kline object as pushed by the upstream feed. Numeric fields arrive
/// as decimal strings; `start` is milliseconds since epoch.
#[derive(Debug, Deserialize)]
struct WsKline {
    start: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
    #[serde(default)]
    confirm: bool,
}

impl WsKline {
    fn into_candle(self, key: StreamKey) -> Candle {
        Candle {
            symbol: key.symbol,
            interval: key.interval,
            time: self.start / 1000,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            confirm: self.confirm,
        }
    }
}
