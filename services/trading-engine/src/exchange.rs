//! Paper exchange
//!
//! The public order-intake boundary. Stateless between calls: validation,
//! price lookup, dispatch by order type, and the persistence hand-off all
//! happen here, while the money math lives in the portfolio. The whole
//! execution pipeline runs under the registry guard, so an order and a
//! price tick for the same user never interleave.

use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use types::errors::TradeError;
use types::ids::{OrderId, UserId};
use types::journal::JournalEntry;
use types::order::{OrderRecord, OrderRequest, OrderResult, OrderSide, OrderStatus, OrderType};
use types::position::PositionSnapshot;
use types::symbol::Symbol;

use crate::config;
use crate::portfolio::Execution;
use crate::registry::PortfolioRegistry;
use crate::store::PortfolioStore;

/// Simulated exchange executing orders against the latest price.
pub struct PaperExchange {
    registry: Arc<PortfolioRegistry>,
    store: Option<Arc<PortfolioStore>>,
}

impl PaperExchange {
    pub fn new(registry: Arc<PortfolioRegistry>, store: Option<Arc<PortfolioStore>>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<PortfolioRegistry> {
        &self.registry
    }

    /// Submit an order for immediate execution.
    ///
    /// Market orders fill at the latest price; crossed limit orders fill at
    /// the bounded price (`min(current, limit)` for BUY, `max` for SELL);
    /// everything else is rejected with a structured result.
    pub async fn submit_order(&self, user: UserId, request: OrderRequest) -> OrderResult {
        match self.execute(user, &request).await {
            Ok(result) => result,
            Err(err) => {
                debug!(%user, error = %err, code = err.code(), "order rejected");
                OrderResult::rejected(&err)
            }
        }
    }

    /// Close an open position: sugar for a reduce-only market order on the
    /// opposing side with the position's quantity (or a supplied partial).
    pub async fn close_position(
        &self,
        user: UserId,
        symbol: &str,
        qty: Option<Decimal>,
    ) -> OrderResult {
        let parsed = match Symbol::from_str(symbol) {
            Ok(parsed) => parsed,
            Err(_) => {
                return OrderResult::rejected(&TradeError::InvalidSymbol {
                    symbol: symbol.to_owned(),
                })
            }
        };

        let position = self.registry.get_position(user, parsed).await;
        let Some(position) = position.filter(|position| position.is_open) else {
            return OrderResult::rejected(&TradeError::NoPosition { symbol: parsed });
        };

        let side = match position.side {
            types::position::PositionSide::Long => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        self.submit_order(
            user,
            OrderRequest {
                symbol: symbol.to_owned(),
                side,
                order_type: OrderType::Market,
                qty: qty.unwrap_or(position.qty),
                price: None,
                reduce_only: true,
                leverage: None,
            },
        )
        .await
    }

    async fn execute(&self, user: UserId, request: &OrderRequest) -> Result<OrderResult, TradeError> {
        let symbol = Symbol::from_str(&request.symbol).map_err(|_| TradeError::InvalidSymbol {
            symbol: request.symbol.clone(),
        })?;
        if request.qty <= Decimal::ZERO {
            return Err(TradeError::InvalidQty);
        }
        if let Some(leverage) = request.leverage {
            if !config::is_supported_leverage(leverage) {
                return Err(TradeError::InvalidLeverage { leverage });
            }
        }

        let (execution, position, portfolio_id) = self
            .registry
            .with_portfolio(user, |portfolio, prices| {
                if portfolio.is_liquidated {
                    return Err(TradeError::AccountLiquidated);
                }
                if let Some(leverage) = request.leverage {
                    portfolio.update_leverage(leverage);
                }

                let current = prices.get(&symbol).copied().unwrap_or(Decimal::ZERO);
                if current <= Decimal::ZERO {
                    return Err(TradeError::NoPrice { symbol });
                }

                let fill_price = fill_price_for(request, current)?;
                let execution = if request.reduce_only {
                    portfolio.close_position(symbol, Some(request.qty), fill_price)?
                } else {
                    portfolio.open_position(symbol, request.side, request.qty, fill_price)?
                };

                let position = portfolio.position(symbol).snapshot();
                Ok((execution, position, portfolio.id))
            })
            .await?;

        let order_id = self
            .persist_fill(user, request, symbol, portfolio_id, &execution)
            .await;

        Ok(OrderResult::filled(
            order_id,
            execution.filled_qty,
            execution.fill_price,
            execution.fee,
            Some(position),
        ))
    }

    /// Write the order row and any journal entry, then sync the portfolio.
    ///
    /// Persistence failures are logged and never change the client result:
    /// the in-memory fill stands and the next sync catches up.
    async fn persist_fill(
        &self,
        user: UserId,
        request: &OrderRequest,
        symbol: Symbol,
        portfolio_id: types::ids::PortfolioId,
        execution: &Execution,
    ) -> OrderId {
        let order_id = OrderId::new();
        let Some(store) = &self.store else {
            return order_id;
        };

        let journal = execution.closed.as_ref().map(|leg| {
            JournalEntry::for_closed_leg(
                portfolio_id,
                symbol,
                leg.side,
                leg.entry_price,
                leg.exit_price,
                leg.qty,
                leg.realized_pnl,
                leg.leverage,
                leg.opened_at,
            )
        });

        let now = Utc::now();
        let record = OrderRecord {
            id: order_id,
            portfolio_id,
            symbol,
            side: request.side,
            order_type: request.order_type,
            qty: request.qty,
            price: request.price,
            filled_qty: execution.filled_qty,
            avg_fill_price: execution.fill_price,
            status: OrderStatus::Filled,
            reduce_only: request.reduce_only,
            created_at: now,
            filled_at: Some(now),
        };

        if let Err(err) = store.record_fill(&record, journal.as_ref()).await {
            let failure = TradeError::PersistenceFailed {
                reason: err.to_string(),
            };
            warn!(%user, order_id = %order_id, error = %failure, "fill not persisted");
        }
        self.registry.sync_to_storage(user).await;

        order_id
    }

    // -- read surface ------------------------------------------------------

    pub async fn get_portfolio(&self, user: UserId) -> crate::portfolio::PortfolioSnapshot {
        self.registry.ensure_portfolio(user).await
    }

    pub async fn get_position(&self, user: UserId, symbol: Symbol) -> Option<PositionSnapshot> {
        self.registry.get_position(user, symbol).await
    }
}

/// Resolve the price a request fills at, given the latest price.
fn fill_price_for(request: &OrderRequest, current: Decimal) -> Result<Decimal, TradeError> {
    match request.order_type {
        OrderType::Market => Ok(current),
        OrderType::Limit => {
            let Some(limit) = request.price else {
                return Err(TradeError::InvalidPrice);
            };
            let crossed = match request.side {
                OrderSide::Buy => current <= limit,
                OrderSide::Sell => current >= limit,
            };
            if !crossed {
                // A resting limit book is out of scope
                return Err(TradeError::Unsupported {
                    feature: "resting limit orders",
                });
            }
            // Never fill worse than the limit
            Ok(match request.side {
                OrderSide::Buy => current.min(limit),
                OrderSide::Sell => current.max(limit),
            })
        }
        OrderType::Stop => Err(TradeError::Unsupported {
            feature: "STOP orders",
        }),
    }
}
