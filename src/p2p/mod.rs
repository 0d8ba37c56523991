//! P2P trading types
//!
//! Advertised-order model: a maker posts an ad (OPEN), a taker takes it,
//! fiat moves off-platform, and the platform escrows the crypto leg until
//! release or refund. The engine in [`engine`] owns every status mutation.

pub mod engine;

pub use engine::P2pEngine;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core_types::{P2pOrderId, Token, UserId};
use crate::money::MoneyError;
use crate::store::StoreError;
use crate::wallet::WalletError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum P2pSide {
    /// Maker wants to buy crypto (pays fiat).
    Buy,
    /// Maker wants to sell crypto (receives fiat).
    Sell,
}

impl fmt::Display for P2pSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            P2pSide::Buy => "BUY",
            P2pSide::Sell => "SELL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum P2pStatus {
    Open,
    InProgress,
    PaymentSent,
    Completed,
    Cancelled,
    Dispute,
    /// Admin verdict recorded; escrow movement in flight. Reconciliation
    /// treats a crash here as "verdict decided, money not yet moved".
    Resolved,
}

impl P2pStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, P2pStatus::Completed | P2pStatus::Cancelled)
    }

    /// States during which the crypto leg sits in escrow.
    pub fn holds_escrow(&self) -> bool {
        matches!(
            self,
            P2pStatus::InProgress | P2pStatus::PaymentSent | P2pStatus::Dispute
        )
    }
}

impl fmt::Display for P2pStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            P2pStatus::Open => "OPEN",
            P2pStatus::InProgress => "IN_PROGRESS",
            P2pStatus::PaymentSent => "PAYMENT_SENT",
            P2pStatus::Completed => "COMPLETED",
            P2pStatus::Cancelled => "CANCELLED",
            P2pStatus::Dispute => "DISPUTE",
            P2pStatus::Resolved => "RESOLVED",
        })
    }
}

/// Admin verdict for a disputed deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Escrow returns to its original owner; deal is CANCELLED.
    Refund,
    /// Escrow goes to the buyer; deal is COMPLETED.
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pOrder {
    pub id: P2pOrderId,
    pub maker_id: UserId,
    pub taker_id: Option<UserId>,
    pub side: P2pSide,
    /// Crypto leg (escrowed by the platform).
    pub base_currency: Token,
    /// Fiat leg (settles off-platform through the payment method).
    pub quote_currency: Token,
    #[serde(with = "rust_decimal::serde::str")]
    pub crypto_amount: Decimal,
    /// Price per unit of base, in quote currency.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub payment_method_id: String,
    pub status: P2pStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub dispute_reason: Option<String>,
}

impl P2pOrder {
    /// The party whose crypto is escrowed: maker on SELL ads, taker on BUY
    /// ads.
    pub fn crypto_seller(&self) -> Option<UserId> {
        match self.side {
            P2pSide::Sell => Some(self.maker_id),
            P2pSide::Buy => self.taker_id,
        }
    }

    /// The party who pays fiat and receives the crypto.
    pub fn crypto_buyer(&self) -> Option<UserId> {
        match self.side {
            P2pSide::Sell => self.taker_id,
            P2pSide::Buy => Some(self.maker_id),
        }
    }

    pub fn is_party(&self, user: UserId) -> bool {
        self.maker_id == user || self.taker_id == Some(user)
    }

    /// Total fiat the buyer owes: `price x crypto_amount`.
    pub fn fiat_total(&self) -> Decimal {
        self.price * self.crypto_amount
    }
}

/// Insert payload; the store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewP2pOrder {
    pub maker_id: UserId,
    pub side: P2pSide,
    pub base_currency: Token,
    pub quote_currency: Token,
    pub crypto_amount: Decimal,
    pub price: Decimal,
    pub payment_method_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Optional filters for the open-ads listing.
#[derive(Debug, Clone, Default)]
pub struct OpenOrderFilter {
    pub base_currency: Option<Token>,
    pub quote_currency: Option<Token>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pMessage {
    pub id: i64,
    pub order_id: P2pOrderId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub order_id: P2pOrderId,
    pub reviewer_id: UserId,
    /// The counterparty being rated.
    pub subject_id: UserId,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user P2P track record (denormalized from orders + reviews).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct P2pUserStats {
    pub completed_deals: u64,
    pub cancelled_deals: u64,
    pub review_count: u64,
    /// Mean of received ratings; None until the first review lands.
    pub average_rating: Option<Decimal>,
}

#[derive(Debug, Error)]
pub enum P2pError {
    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("p2p order {0} not found")]
    NotFound(P2pOrderId),

    #[error("p2p order {0} is no longer open")]
    NotOpen(P2pOrderId),

    #[error("p2p order {id} is {status}; {action} is not allowed")]
    InvalidTransition {
        id: P2pOrderId,
        status: P2pStatus,
        action: &'static str,
    },

    #[error("user {user} is not authorized for {action} on order {id}")]
    NotAuthorized {
        id: P2pOrderId,
        user: UserId,
        action: &'static str,
    },

    #[error("maker cannot take their own order {0}")]
    SelfTrade(P2pOrderId),

    #[error("escrow inconsistent for order {0}; flagged for manual reconciliation")]
    EscrowInconsistent(P2pOrderId),

    #[error("rating must be between 1 and 5")]
    InvalidRating,

    #[error("review already submitted for order {0}")]
    ReviewExists(P2pOrderId),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("wallet failure: {0}")]
    Wallet(#[from] WalletError),
}
