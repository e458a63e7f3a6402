//! Order-queue worker
//!
//! Pops order envelopes from a list-style queue and feeds them to the
//! exchange. There is no response channel: results are logged, and clients
//! observe the outcome through their portfolio event stream.

use redis::AsyncCommands;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use types::ids::UserId;
use types::order::OrderRequest;
use uuid::Uuid;

use crate::exchange::PaperExchange;

/// Queue key the worker blocks on.
pub const ORDERS_QUEUE: &str = "orders_queue";

/// One queued order submission.
#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    user_id: Uuid,
    order: OrderRequest,
}

/// Run the worker loop forever: block-pop, decode, execute, log.
///
/// Malformed envelopes are logged and skipped; transient queue errors back
/// off for a second and retry.
pub async fn run_order_worker(redis_url: &str, exchange: Arc<PaperExchange>) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = redis::aio::ConnectionManager::new(client).await?;
    info!(queue = ORDERS_QUEUE, "order worker listening");

    loop {
        let popped: Option<(String, String)> = match conn.blpop(ORDERS_QUEUE, 1.0).await {
            Ok(popped) => popped,
            Err(err) => {
                error!(error = %err, "queue pop failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some((_, payload)) = popped else {
            continue;
        };
        handle_envelope(&exchange, &payload).await;
    }
}

async fn handle_envelope(exchange: &PaperExchange, payload: &str) {
    let envelope: OrderEnvelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "malformed order envelope");
            return;
        }
    };

    let user = UserId::from_uuid(envelope.user_id);
    let result = exchange.submit_order(user, envelope.order).await;
    if result.success {
        info!(
            %user,
            order_id = %result.order_id.expect("filled orders carry an id"),
            "queued order executed"
        );
    } else {
        warn!(
            %user,
            code = result.error.as_deref().unwrap_or("UNKNOWN"),
            message = %result.message,
            "queued order rejected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use types::order::{OrderSide, OrderType};

    #[test]
    fn test_envelope_decoding() {
        let payload = r#"{
            "user_id": "018f3a2b-0000-7000-8000-000000000001",
            "order": {
                "symbol": "BTC-USDT",
                "side": "BUY",
                "order_type": "MARKET",
                "qty": "0.1",
                "reduce_only": false,
                "leverage": 10
            }
        }"#;

        let envelope: OrderEnvelope = serde_json::from_str(payload).unwrap();
        assert_eq!(envelope.order.symbol, "BTC-USDT");
        assert_eq!(envelope.order.side, OrderSide::Buy);
        assert_eq!(envelope.order.order_type, OrderType::Market);
        assert_eq!(envelope.order.qty, dec!(0.1));
        assert_eq!(envelope.order.leverage, Some(10));
    }

    #[test]
    fn test_envelope_rejects_missing_order() {
        let payload = r#"{"user_id": "018f3a2b-0000-7000-8000-000000000001"}"#;
        assert!(serde_json::from_str::<OrderEnvelope>(payload).is_err());
    }
}
