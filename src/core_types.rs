//! Core types used throughout the system
//!
//! Fundamental aliases and small wrappers shared by every module.
//! They provide semantic meaning and enable future type evolution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User ID - globally unique, immutable after assignment.
///
/// Primary key for user rows and the owner key for wallet balances.
pub type UserId = i64;

/// Spot order ID - monotonic, assigned by the order store.
pub type OrderId = i64;

/// P2P order ID - monotonic, assigned by the P2P store.
pub type P2pOrderId = i64;

/// Blockchain network a token lives on (e.g. "TON", "SOLANA").
///
/// Stored uppercase; comparison is case-sensitive after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Network(String);

impl Network {
    /// Normalize and wrap a network name. Empty input is rejected upstream
    /// by config/order validation.
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token symbol or opaque token address, as the venue wire expects it.
///
/// Symbols are uppercase ASCII; addresses pass through untouched (the
/// wallet adapter owns address validation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(raw: &str) -> Self {
        let t = raw.trim();
        // Addresses are long and mixed-case; short tickers get normalized.
        if t.len() <= 12 && t.chars().all(|c| c.is_ascii_alphanumeric()) {
            Self(t.to_ascii_uppercase())
        } else {
            Self(t.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
