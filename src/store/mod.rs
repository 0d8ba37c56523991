//! Persistent store
//!
//! Repository traits the engines depend on, with two interchangeable
//! backends: [`memory::MemoryStore`] (tests, single-node dev) and
//! [`postgres::PgStore`]. Entities map one-to-one to tables:
//! `spot_orders`, `p2p_orders`, `p2p_messages`, `p2p_reviews`, `users`,
//! `transactions`, `market_data`.
//!
//! Status transitions are compare-and-set: `finalize_order` /
//! `transition_p2p` only apply when the row still carries the expected
//! status, and return `None` to the losing caller.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{Network, OrderId, P2pOrderId, Token, UserId};
use crate::dex::SwapOutcome;
use crate::orders::{NewSpotOrder, OrderStatus, SpotOrder};
use crate::p2p::{
    NewP2pOrder, OpenOrderFilter, P2pMessage, P2pOrder, P2pSide, P2pStatus, P2pUserStats, Review,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("stored value malformed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Terminal update applied to a PENDING spot order.
#[derive(Debug, Clone)]
pub struct OrderFinalize {
    pub status: OrderStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub execution_details: Option<SwapOutcome>,
    pub error: Option<String>,
}

impl OrderFinalize {
    pub fn completed(details: SwapOutcome) -> Self {
        Self {
            status: OrderStatus::Completed,
            executed_at: Some(Utc::now()),
            cancelled_at: None,
            execution_details: Some(details),
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            status: OrderStatus::Failed,
            executed_at: None,
            cancelled_at: None,
            execution_details: None,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: OrderStatus::Cancelled,
            executed_at: None,
            cancelled_at: Some(Utc::now()),
            execution_details: None,
            error: None,
        }
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, new: NewSpotOrder) -> Result<SpotOrder, StoreError>;

    async fn get_order(&self, id: OrderId) -> Result<Option<SpotOrder>, StoreError>;

    /// Most recent first.
    async fn list_user_orders(
        &self,
        user: UserId,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SpotOrder>, StoreError>;

    /// CAS PENDING -> terminal. `None` means the order was not PENDING
    /// (or absent); the caller lost the race and should re-read.
    async fn finalize_order(
        &self,
        id: OrderId,
        update: OrderFinalize,
    ) -> Result<Option<SpotOrder>, StoreError>;

    /// PENDING orders created before `cutoff` (startup recovery sweep).
    async fn list_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SpotOrder>, StoreError>;
}

/// Field changes applied together with a P2P status CAS.
#[derive(Debug, Clone, Default)]
pub struct P2pPatch {
    pub taker_id: Option<UserId>,
    pub dispute_reason: Option<String>,
}

#[async_trait]
pub trait P2pStore: Send + Sync {
    async fn insert_p2p(&self, new: NewP2pOrder) -> Result<P2pOrder, StoreError>;

    async fn get_p2p(&self, id: P2pOrderId) -> Result<Option<P2pOrder>, StoreError>;

    /// CAS `expect` -> `to`, applying `patch` atomically. `None` means the
    /// row no longer carries `expect`.
    async fn transition_p2p(
        &self,
        id: P2pOrderId,
        expect: P2pStatus,
        to: P2pStatus,
        patch: P2pPatch,
    ) -> Result<Option<P2pOrder>, StoreError>;

    async fn list_open(
        &self,
        side: P2pSide,
        filter: &OpenOrderFilter,
    ) -> Result<Vec<P2pOrder>, StoreError>;

    async fn list_expired_open(&self, now: DateTime<Utc>) -> Result<Vec<P2pOrder>, StoreError>;

    /// All orders currently in `status` (reconciliation sweeps).
    async fn list_by_status(&self, status: P2pStatus) -> Result<Vec<P2pOrder>, StoreError>;

    async fn list_user_p2p(&self, user: UserId) -> Result<Vec<P2pOrder>, StoreError>;

    async fn insert_message(
        &self,
        order_id: P2pOrderId,
        sender: UserId,
        text: &str,
    ) -> Result<P2pMessage, StoreError>;

    async fn list_messages(&self, order_id: P2pOrderId) -> Result<Vec<P2pMessage>, StoreError>;

    /// At most one review per (order, reviewer); violations return
    /// `StoreError::Duplicate("review")`.
    async fn insert_review(&self, review: Review) -> Result<(), StoreError>;

    async fn list_order_reviews(&self, order_id: P2pOrderId) -> Result<Vec<Review>, StoreError>;

    async fn p2p_user_stats(&self, user: UserId) -> Result<P2pUserStats, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub rating_count: i64,
    pub rating_sum: i64,
}

impl User {
    pub fn average_rating(&self) -> Option<Decimal> {
        if self.rating_count == 0 {
            return None;
        }
        Some(Decimal::from(self.rating_sum) / Decimal::from(self.rating_count))
    }
}

/// Copy-trading subscription: `follower_id` mirrors `leader_id`'s completed
/// orders at `ratio`, provided the follower balance covers `min_balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerRule {
    pub follower_id: UserId,
    pub leader_id: UserId,
    #[serde(with = "rust_decimal::serde::str")]
    pub ratio: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_balance: Decimal,
    pub active: bool,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert_user(&self, id: UserId, username: Option<&str>) -> Result<User, StoreError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn touch_activity(&self, id: UserId) -> Result<(), StoreError>;

    async fn count_active_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn list_user_ids(&self) -> Result<Vec<UserId>, StoreError>;

    /// Fold a received review rating into the denormalized aggregate.
    async fn add_rating(&self, user: UserId, rating: u8) -> Result<(), StoreError>;

    async fn followers_of(&self, leader: UserId) -> Result<Vec<FollowerRule>, StoreError>;

    async fn upsert_follower_rule(&self, rule: FollowerRule) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Swap,
    EscrowLock,
    EscrowRelease,
    EscrowRefund,
    Withdrawal,
    Fee,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Swap => "swap",
            TxKind::EscrowLock => "escrow_lock",
            TxKind::EscrowRelease => "escrow_release",
            TxKind::EscrowRefund => "escrow_refund",
            TxKind::Withdrawal => "withdrawal",
            TxKind::Fee => "fee",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: UserId,
    pub kind: TxKind,
    pub network: Option<Network>,
    pub asset: Token,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    /// Free-form link back to the causing entity ("spot:42", "p2p:7").
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub kind: TxKind,
    pub network: Option<Network>,
    pub asset: Token,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub reference: Option<String>,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn record_transaction(
        &self,
        new: NewTransaction,
    ) -> Result<TransactionRecord, StoreError>;

    async fn list_user_transactions(
        &self,
        user: UserId,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError>;
}

#[async_trait]
pub trait MarketDataStore: Send + Sync {
    async fn record_price(
        &self,
        network: &Network,
        token: &Token,
        price: Decimal,
    ) -> Result<(), StoreError>;

    async fn latest_price(
        &self,
        network: &Network,
        token: &Token,
    ) -> Result<Option<Decimal>, StoreError>;
}
