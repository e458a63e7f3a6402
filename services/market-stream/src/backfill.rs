//! Historical candle backfill over the upstream REST API
//!
//! Two entry points: a single-shot fetch bounded by the upstream's 200-row
//! page size, and a paginated fetch that walks backwards through time using
//! the oldest row's start time minus one millisecond as the next upper
//! bound. Both return candles in chronological order.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};
use types::candle::{Candle, Interval};
use types::symbol::Symbol;

use crate::driver::FeedDriver;
use crate::stream::{PriceExtremes, StreamError};

/// Upstream page size cap per request.
pub const MAX_PAGE_SIZE: usize = 200;

/// Cap for one paginated walk.
pub const MAX_PAGINATED: usize = 1000;

/// Pause between paginated requests to stay under the upstream rate limit.
const PAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: KlineResult,
}

#[derive(Debug, Default, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

/// Decode one upstream row: `[startMs, open, high, low, close, volume, turnover]`.
///
/// Historical rows are always closed candles, so `confirm` is true.
fn row_to_candle(symbol: Symbol, interval: Interval, row: &[String]) -> Option<Candle> {
    let start_ms: i64 = row.first()?.parse().ok()?;
    let parse = |idx: usize| -> Option<Decimal> { row.get(idx)?.parse().ok() };

    Some(Candle {
        symbol,
        interval,
        time: start_ms / 1000,
        open: parse(1)?,
        high: parse(2)?,
        low: parse(3)?,
        close: parse(4)?,
        volume: parse(5)?,
        confirm: true,
    })
}

async fn fetch_page(
    http: &reqwest::Client,
    driver: &FeedDriver,
    symbol: Symbol,
    interval: Interval,
    limit: usize,
    end_ms: Option<i64>,
) -> Result<Vec<Vec<String>>, StreamError> {
    let mut query: Vec<(&str, String)> = vec![
        ("category", driver.category.to_owned()),
        ("symbol", symbol.upstream().to_owned()),
        ("interval", interval.code().to_owned()),
        ("limit", limit.min(MAX_PAGE_SIZE).to_string()),
    ];
    if let Some(end) = end_ms {
        query.push(("end", end.to_string()));
    }

    let response = http
        .get(driver.kline_endpoint())
        .query(&query)
        .send()
        .await?
        .error_for_status()?;

    let payload: KlineResponse = response.json().await?;
    if payload.ret_code != 0 {
        return Err(StreamError::Upstream {
            reason: format!("retCode {}: {}", payload.ret_code, payload.ret_msg),
        });
    }

    Ok(payload.result.list)
}

/// Fetch up to 200 candles ending now (or at `end_ms`), oldest first.
pub async fn fetch_klines(
    http: &reqwest::Client,
    driver: &FeedDriver,
    symbol: Symbol,
    interval: Interval,
    limit: usize,
    end_ms: Option<i64>,
) -> Result<Vec<Candle>, StreamError> {
    let rows = fetch_page(http, driver, symbol, interval, limit, end_ms).await?;

    // Upstream returns rows newest-first
    let candles = rows
        .iter()
        .rev()
        .filter_map(|row| row_to_candle(symbol, interval, row))
        .collect();
    Ok(candles)
}

/// Fetch up to 1000 candles by walking pages backwards through time.
///
/// Each page's upper bound is the previous page's oldest start time minus
/// one millisecond; pages are spaced out to respect the upstream rate
/// limit. The result is sorted chronologically.
pub async fn fetch_klines_paginated(
    http: &reqwest::Client,
    driver: &FeedDriver,
    symbol: Symbol,
    interval: Interval,
    limit: usize,
) -> Result<Vec<Candle>, StreamError> {
    let mut remaining = limit.min(MAX_PAGINATED);
    let mut end_ms: Option<i64> = None;
    let mut all_candles: Vec<Candle> = Vec::new();

    while remaining > 0 {
        let batch_limit = remaining.min(MAX_PAGE_SIZE);
        let batch = fetch_klines(http, driver, symbol, interval, batch_limit, end_ms).await?;
        if batch.is_empty() {
            break;
        }

        debug!(
            symbol = %symbol,
            interval = %interval,
            rows = batch.len(),
            "fetched backfill page"
        );

        // Oldest candle's start, one millisecond back, bounds the next page
        end_ms = Some(batch[0].time * 1000 - 1);
        remaining = remaining.saturating_sub(batch.len());
        all_candles.extend(batch);

        if remaining > 0 {
            tokio::time::sleep(PAGE_DELAY).await;
        }
    }

    all_candles.sort_by_key(|candle| candle.time);
    Ok(all_candles)
}

/// Sample the all-time high and low from weekly candles.
///
/// The sample is bounded by the upstream page size, so this is an
/// approximation of the true extremes. Failures are logged and yield the
/// empty default rather than an error.
pub async fn fetch_extremes(
    http: &reqwest::Client,
    driver: &FeedDriver,
    symbol: Symbol,
) -> PriceExtremes {
    match fetch_klines(http, driver, symbol, Interval::Week, MAX_PAGE_SIZE, None).await {
        Ok(candles) if !candles.is_empty() => {
            let ath = candles.iter().map(|c| c.high).max();
            let atl = candles.iter().map(|c| c.low).min();
            PriceExtremes {
                ath,
                atl,
                updated_at: Some(chrono::Utc::now()),
            }
        }
        Ok(_) => {
            warn!(symbol = %symbol, "no weekly candles for extremes");
            PriceExtremes::default()
        }
        Err(err) => {
            warn!(symbol = %symbol, error = %err, "failed to fetch extremes");
            PriceExtremes::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(start_ms: i64, close: &str) -> Vec<String> {
        vec![
            start_ms.to_string(),
            "100.0".to_owned(),
            "110.0".to_owned(),
            "90.0".to_owned(),
            close.to_owned(),
            "12.5".to_owned(),
            "1250.0".to_owned(),
        ]
    }

    #[test]
    fn test_row_to_candle() {
        let candle =
            row_to_candle(Symbol::BtcUsdt, Interval::Min1, &row(1_700_000_040_000, "105.5"))
                .unwrap();

        assert_eq!(candle.time, 1_700_000_040);
        assert_eq!(candle.open, dec!(100.0));
        assert_eq!(candle.high, dec!(110.0));
        assert_eq!(candle.low, dec!(90.0));
        assert_eq!(candle.close, dec!(105.5));
        assert_eq!(candle.volume, dec!(12.5));
        assert!(candle.confirm);
    }

    #[test]
    fn test_row_to_candle_rejects_malformed() {
        assert!(row_to_candle(Symbol::BtcUsdt, Interval::Min1, &[]).is_none());

        let mut bad = row(1_700_000_040_000, "105.5");
        bad[2] = "not-a-number".to_owned();
        assert!(row_to_candle(Symbol::BtcUsdt, Interval::Min1, &bad).is_none());
    }

    #[test]
    fn test_response_decoding_newest_first() {
        let json = format!(
            r#"{{"retCode":0,"retMsg":"OK","result":{{"list":[{},{}]}}}}"#,
            serde_json::to_string(&row(1_700_000_100_000, "106")).unwrap(),
            serde_json::to_string(&row(1_700_000_040_000, "105")).unwrap(),
        );
        let payload: KlineResponse = serde_json::from_str(&json).unwrap();

        assert_eq!(payload.ret_code, 0);
        assert_eq!(payload.result.list.len(), 2);

        // fetch_klines reverses into chronological order
        let candles: Vec<Candle> = payload
            .result
            .list
            .iter()
            .rev()
            .filter_map(|r| row_to_candle(Symbol::BtcUsdt, Interval::Min1, r))
            .collect();
        assert_eq!(candles[0].time, 1_700_000_040);
        assert_eq!(candles[1].time, 1_700_000_100);
    }

    #[test]
    fn test_error_payload_decoding() {
        let json = r#"{"retCode":10001,"retMsg":"params error"}"#;
        let payload: KlineResponse = serde_json::from_str(json).unwrap();
        assert_eq!(payload.ret_code, 10001);
        assert!(payload.result.list.is_empty());
    }
}
