//! Spot order types
//!
//! A spot order is one user-requested swap: immediate (MARKET) or
//! conditional (STOP_LOSS / TAKE_PROFIT, armed with a trigger price).
//! Terminal states are absorbing; the engine in [`engine`] owns every
//! status mutation.

pub mod engine;
pub mod watcher;

pub use engine::OrderEngine;
pub use watcher::TriggerWatcher;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::cache::CacheError;
use crate::core_types::{Network, OrderId, Token, UserId};
use crate::dex::{AggregatorError, SwapOutcome};
use crate::money::MoneyError;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    StopLoss,
    TakeProfit,
}

impl OrderType {
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::TakeProfit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Market => "MARKET",
            OrderType::StopLoss => "STOP_LOSS",
            OrderType::TakeProfit => "TAKE_PROFIT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    /// COMPLETED / FAILED / CANCELLED are absorbing.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Trigger condition attached to a conditional order.
///
/// STOP_LOSS fires when price falls to or below the trigger;
/// TAKE_PROFIT fires when price rises to or above it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderConditions {
    #[serde(with = "rust_decimal::serde::str")]
    pub trigger_price: Decimal,
    pub direction: TriggerDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerDirection {
    StopLoss,
    TakeProfit,
}

impl TriggerDirection {
    pub fn fires(&self, current_price: Decimal, trigger_price: Decimal) -> bool {
        match self {
            TriggerDirection::StopLoss => current_price <= trigger_price,
            TriggerDirection::TakeProfit => current_price >= trigger_price,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub order_type: OrderType,
    pub network: Network,
    pub from_token: Token,
    pub to_token: Token,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub conditions: Option<OrderConditions>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub execution_details: Option<SwapOutcome>,
    pub error: Option<String>,
}

/// Insert payload; the store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewSpotOrder {
    pub user_id: UserId,
    pub order_type: OrderType,
    pub network: Network,
    pub from_token: Token,
    pub to_token: Token,
    pub amount: Decimal,
    pub conditions: Option<OrderConditions>,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("conditional order requires trigger conditions")]
    MissingConditions,

    #[error("market order does not take conditions")]
    UnexpectedConditions,

    #[error("order {0} not found")]
    NotFound(OrderId),

    #[error("order {id} is already {status}")]
    AlreadyTerminal { id: OrderId, status: OrderStatus },

    #[error("swap failed: {0}")]
    Swap(#[source] AggregatorError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),
}
