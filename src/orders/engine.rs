//! Order engine
//!
//! Owns every spot-order status mutation. MARKET orders execute
//! synchronously on creation; conditional orders are parked in the trigger
//! index (a cache hash per (network, from_token) pair) until the watcher
//! fires them. `execute` is idempotent on terminal state: the status flip
//! PENDING -> terminal is a single compare-and-set in the store and the
//! losing caller gets the persisted result back.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::{
    NewSpotOrder, OrderConditions, OrderError, OrderStatus, OrderType, SpotOrder,
};
use crate::cache::{CacheExt, CacheStore};
use crate::core_types::{Network, OrderId, Token, UserId};
use crate::dex::{AggregatorError, DexAggregator};
use crate::events::{EventBus, OrderCompleted};
use crate::money;
use crate::notify::{NotificationPort, kinds};
use crate::store::{NewTransaction, OrderFinalize, OrderStore, TransactionStore, TxKind};
use crate::telemetry;

/// Cache set holding every (network, from_token) pair under watch.
pub const TRACKING_PAIRS_KEY: &str = "tracking_pairs";

/// Cache hash holding the conditional orders for one watched pair.
pub fn tracking_hash_key(network: &Network, token: &Token) -> String {
    format!("tracking_orders:{}:{}", network, token)
}

fn pair_member(network: &Network, token: &Token) -> String {
    format!("{}:{}", network, token)
}

/// Trigger-index entry for one conditional order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: OrderId,
    #[serde(with = "rust_decimal::serde::str")]
    pub trigger_price: Decimal,
    pub direction: super::TriggerDirection,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

pub struct OrderEngine {
    store: Arc<dyn OrderStore>,
    transactions: Arc<dyn TransactionStore>,
    aggregator: Arc<DexAggregator>,
    cache: Arc<dyn CacheStore>,
    notifier: Arc<dyn NotificationPort>,
    events: EventBus,
    slippage_bps: u32,
}

impl OrderEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        transactions: Arc<dyn TransactionStore>,
        aggregator: Arc<DexAggregator>,
        cache: Arc<dyn CacheStore>,
        notifier: Arc<dyn NotificationPort>,
        events: EventBus,
        slippage_bps: u32,
    ) -> Self {
        Self {
            store,
            transactions,
            aggregator,
            cache,
            notifier,
            events,
            slippage_bps,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Validate and persist a new order. MARKET executes immediately;
    /// conditional orders are registered for trigger watching.
    pub async fn create_order(
        &self,
        user_id: UserId,
        order_type: OrderType,
        network: Network,
        from_token: Token,
        to_token: Token,
        amount: Decimal,
        conditions: Option<OrderConditions>,
    ) -> Result<SpotOrder, OrderError> {
        money::ensure_positive(amount)?;
        match (order_type.is_conditional(), &conditions) {
            (true, None) => return Err(OrderError::MissingConditions),
            (false, Some(_)) => return Err(OrderError::UnexpectedConditions),
            (true, Some(c)) => {
                money::ensure_positive(c.trigger_price)?;
            }
            (false, None) => {}
        }

        let order = self
            .store
            .insert_order(NewSpotOrder {
                user_id,
                order_type,
                network,
                from_token,
                to_token,
                amount,
                conditions,
            })
            .await?;
        info!(order_id = order.id, user_id, %order_type, "order created");
        telemetry::track_user_operation("create_order");

        if order.order_type == OrderType::Market {
            return self.execute(order.id).await;
        }
        self.track(&order).await?;
        Ok(order)
    }

    /// Execute a PENDING order through the aggregator. Calling this on a
    /// terminal order returns the stored result without re-executing.
    pub async fn execute(&self, order_id: OrderId) -> Result<SpotOrder, OrderError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        if order.status.is_terminal() {
            return Ok(order);
        }

        let pair = format!("{}/{}", order.from_token, order.to_token);
        let volume = order.amount.to_f64().unwrap_or(0.0);
        let started = Instant::now();
        let swap = self
            .aggregator
            .execute_swap(
                &order.network,
                &order.from_token,
                &order.to_token,
                order.amount,
                self.slippage_bps,
            )
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match swap {
            Ok(outcome) => {
                let Some(updated) = self
                    .store
                    .finalize_order(order_id, OrderFinalize::completed(outcome.clone()))
                    .await?
                else {
                    // another executor won the CAS; return its result
                    return Ok(self
                        .store
                        .get_order(order_id)
                        .await?
                        .ok_or(OrderError::NotFound(order_id))?);
                };

                telemetry::track_swap(
                    &outcome.venue,
                    updated.network.as_str(),
                    &pair,
                    elapsed,
                    volume,
                    true,
                    None,
                );
                if let Err(e) = self
                    .transactions
                    .record_transaction(NewTransaction {
                        user_id: updated.user_id,
                        kind: TxKind::Swap,
                        network: Some(updated.network.clone()),
                        asset: updated.from_token.clone(),
                        amount: updated.amount,
                        tx_hash: Some(outcome.tx_hash.clone()),
                        reference: Some(format!("spot:{}", updated.id)),
                    })
                    .await
                {
                    error!(order_id, "transaction journal write failed: {}", e);
                }
                self.untrack(&updated).await;

                self.events.publish(OrderCompleted {
                    order_id: updated.id,
                    user_id: updated.user_id,
                    network: updated.network.clone(),
                    from_token: updated.from_token.clone(),
                    to_token: updated.to_token.clone(),
                    amount: updated.amount,
                    output_amount: outcome.output_amount,
                    venue: outcome.venue.clone(),
                });
                self.notifier
                    .notify(
                        updated.user_id,
                        kinds::ORDER_COMPLETED,
                        json!({
                            "order_id": updated.id,
                            "pair": pair,
                            "output_amount": outcome.output_amount.to_string(),
                            "tx_hash": outcome.tx_hash,
                        }),
                    )
                    .await;
                info!(order_id, venue = %outcome.venue, "order completed");
                Ok(updated)
            }
            Err(e) => {
                let Some(updated) = self
                    .store
                    .finalize_order(order_id, OrderFinalize::failed(e.to_string()))
                    .await?
                else {
                    return Ok(self
                        .store
                        .get_order(order_id)
                        .await?
                        .ok_or(OrderError::NotFound(order_id))?);
                };

                telemetry::track_swap(
                    "unknown",
                    updated.network.as_str(),
                    &pair,
                    elapsed,
                    volume,
                    false,
                    Some(error_label(&e)),
                );
                self.untrack(&updated).await;
                self.notifier
                    .notify(
                        updated.user_id,
                        kinds::ORDER_FAILED,
                        json!({ "order_id": updated.id, "pair": pair, "error": e.to_string() }),
                    )
                    .await;
                warn!(order_id, "order failed: {}", e);
                Err(OrderError::Swap(e))
            }
        }
    }

    /// Cancel a PENDING order. Terminal orders conflict.
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<SpotOrder, OrderError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        if order.status.is_terminal() {
            return Err(OrderError::AlreadyTerminal {
                id: order_id,
                status: order.status,
            });
        }

        let Some(updated) = self
            .store
            .finalize_order(order_id, OrderFinalize::cancelled())
            .await?
        else {
            let current = self
                .store
                .get_order(order_id)
                .await?
                .ok_or(OrderError::NotFound(order_id))?;
            return Err(OrderError::AlreadyTerminal {
                id: order_id,
                status: current.status,
            });
        };
        self.untrack(&updated).await;
        telemetry::track_user_operation("cancel_order");
        info!(order_id, "order cancelled");
        Ok(updated)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<SpotOrder, OrderError> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    pub async fn list_user_orders(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SpotOrder>, OrderError> {
        Ok(self
            .store
            .list_user_orders(user_id, status, limit, offset)
            .await?)
    }

    /// Startup recovery: conditional PENDING orders older than the shutdown
    /// grace window are re-armed in the trigger index; stale MARKET orders
    /// are left for operator review.
    pub async fn recover_stale_pending(
        &self,
        older_than: chrono::Duration,
    ) -> Result<usize, OrderError> {
        let cutoff = Utc::now() - older_than;
        let stale = self.store.list_pending_older_than(cutoff).await?;
        let mut rearmed = 0;
        for order in stale {
            if order.order_type.is_conditional() {
                self.track(&order).await?;
                rearmed += 1;
            } else {
                warn!(
                    order_id = order.id,
                    "stale PENDING market order needs operator review"
                );
            }
        }
        Ok(rearmed)
    }

    /// Register a conditional order in the trigger index.
    async fn track(&self, order: &SpotOrder) -> Result<(), OrderError> {
        let Some(conditions) = order.conditions else {
            return Ok(());
        };
        let key = tracking_hash_key(&order.network, &order.from_token);
        self.cache
            .hset_json(
                &key,
                &order.id.to_string(),
                &TrackedOrder {
                    order_id: order.id,
                    trigger_price: conditions.trigger_price,
                    direction: conditions.direction,
                    amount: order.amount,
                },
            )
            .await?;
        self.cache
            .sadd(
                TRACKING_PAIRS_KEY,
                json!(pair_member(&order.network, &order.from_token)),
            )
            .await?;
        Ok(())
    }

    /// Drop a terminal conditional order from the trigger index; prunes the
    /// pair entry when its hash empties out.
    async fn untrack(&self, order: &SpotOrder) {
        if !order.order_type.is_conditional() {
            return;
        }
        let key = tracking_hash_key(&order.network, &order.from_token);
        if let Err(e) = self.cache.hdel(&key, &order.id.to_string()).await {
            warn!(order_id = order.id, "trigger index cleanup failed: {}", e);
            return;
        }
        match self.cache.hgetall(&key).await {
            Ok(rest) if rest.is_empty() => {
                let _ = self.cache.delete(&key).await;
                let _ = self
                    .cache
                    .srem(
                        TRACKING_PAIRS_KEY,
                        &json!(pair_member(&order.network, &order.from_token)),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!("trigger index read failed: {}", e),
        }
    }
}

fn error_label(e: &AggregatorError) -> &'static str {
    match e {
        AggregatorError::Money(_) => "validation",
        AggregatorError::UnknownNetwork(_) => "unknown_network",
        AggregatorError::TokenNotFound(_) | AggregatorError::TokenUnavailable { .. } => {
            "token_not_found"
        }
        AggregatorError::NoQuote { .. } => "no_quote",
        AggregatorError::AllVenuesFailed { .. } => "all_venues_failed",
    }
}
