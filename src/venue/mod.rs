//! Venue clients
//!
//! A venue is one DEX HTTP API (ston.fi, DeDust, Orca, ...). Every venue
//! speaks the same minimal wire: quote, swap, token lookup. The aggregator
//! only ever talks to the [`VenueClient`] trait; the HTTP adapter lives in
//! [`http`].

pub mod http;
#[cfg(feature = "mock-venue")]
pub mod mock;

pub use http::HttpVenueClient;
#[cfg(feature = "mock-venue")]
pub use mock::MockVenue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("pair not found on venue")]
    PairNotFound,

    #[error("token not found: {0}")]
    TokenNotFound(String),

    #[error("venue rejected the request: {0}")]
    Rejected(String),

    #[error("venue credentials rejected")]
    Unauthorized,

    #[error("venue response malformed: {0}")]
    InvalidResponse(String),

    #[error("venue timed out")]
    Timeout,

    #[error("transient venue failure: {0}")]
    Transient(String),
}

impl VenueError {
    /// Transport errors, 5xx, and 429 are worth retrying; everything else
    /// is terminal for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Transient(_) | VenueError::Timeout)
    }
}

/// A single venue's answer to a quote request.
#[derive(Debug, Clone)]
pub struct VenueQuote {
    pub output_amount: Decimal,
    pub route: Vec<Value>,
    pub price_impact: Option<f64>,
}

/// A confirmed swap on one venue.
#[derive(Debug, Clone)]
pub struct VenueSwap {
    pub tx_hash: String,
    pub output_amount: Decimal,
}

/// Token metadata from the venue's registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_supply: Option<String>,
    pub network: String,
}

/// The best quote across venues, as returned by the aggregator and cached
/// under `quote:{network}:{from}:{to}:{amount}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub venue: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub input_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub output_amount: Decimal,
    pub route: Vec<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Per-venue adapter (C2). One instance per (network, venue) pair.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Venue name as configured (e.g. "ston.fi").
    fn name(&self) -> &str;

    async fn quote(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<VenueQuote, VenueError>;

    async fn swap(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        min_output: Decimal,
    ) -> Result<VenueSwap, VenueError>;

    async fn token_info(&self, address: &str) -> Result<TokenInfo, VenueError>;
}
