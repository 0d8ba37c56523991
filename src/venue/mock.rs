//! Scripted in-process venue
//!
//! Used by tests and local development runs. Quotes at a fixed rate
//! (output = amount x rate) and answers swaps from a scripted queue, so
//! partial fills, failures, and timeouts are all reproducible without a
//! network.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{TokenInfo, VenueClient, VenueError, VenueQuote, VenueSwap};

#[derive(Debug, Clone)]
enum QuoteScript {
    Rate(Decimal),
    Timeout,
    PairNotFound,
    Transient(String),
}

#[derive(Debug, Clone)]
enum SwapScript {
    Fill { tx_hash: String, output: Decimal },
    Transient(String),
    Rejected(String),
}

pub struct MockVenue {
    name: String,
    quote: QuoteScript,
    swaps: Mutex<VecDeque<SwapScript>>,
    token: Option<TokenInfo>,
}

impl MockVenue {
    /// Venue that quotes `output = amount x rate`.
    pub fn quoting(name: &str, rate: Decimal) -> Self {
        Self {
            name: name.to_string(),
            quote: QuoteScript::Rate(rate),
            swaps: Mutex::new(VecDeque::new()),
            token: None,
        }
    }

    pub fn quote_timeout(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quote: QuoteScript::Timeout,
            swaps: Mutex::new(VecDeque::new()),
            token: None,
        }
    }

    pub fn quote_pair_not_found(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quote: QuoteScript::PairNotFound,
            swaps: Mutex::new(VecDeque::new()),
            token: None,
        }
    }

    pub fn quote_transient(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            quote: QuoteScript::Transient(message.to_string()),
            swaps: Mutex::new(VecDeque::new()),
            token: None,
        }
    }

    /// Queue a successful fill for the next swap call.
    pub fn fill(self, tx_hash: &str, output: Decimal) -> Self {
        self.swaps.lock().unwrap().push_back(SwapScript::Fill {
            tx_hash: tx_hash.to_string(),
            output,
        });
        self
    }

    /// Queue a transient failure for the next swap call.
    pub fn fail_swap(self, message: &str) -> Self {
        self.swaps
            .lock()
            .unwrap()
            .push_back(SwapScript::Transient(message.to_string()));
        self
    }

    /// Queue a non-retryable rejection for the next swap call.
    pub fn reject_swap(self, message: &str) -> Self {
        self.swaps
            .lock()
            .unwrap()
            .push_back(SwapScript::Rejected(message.to_string()));
        self
    }

    pub fn with_token(mut self, token: TokenInfo) -> Self {
        self.token = Some(token);
        self
    }
}

#[async_trait]
impl VenueClient for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quote(&self, _: &str, _: &str, amount: Decimal) -> Result<VenueQuote, VenueError> {
        match &self.quote {
            QuoteScript::Rate(rate) => Ok(VenueQuote {
                output_amount: amount * rate,
                route: vec![],
                price_impact: None,
            }),
            QuoteScript::Timeout => Err(VenueError::Timeout),
            QuoteScript::PairNotFound => Err(VenueError::PairNotFound),
            QuoteScript::Transient(msg) => Err(VenueError::Transient(msg.clone())),
        }
    }

    async fn swap(
        &self,
        _: &str,
        _: &str,
        _: Decimal,
        _: Decimal,
    ) -> Result<VenueSwap, VenueError> {
        match self.swaps.lock().unwrap().pop_front() {
            Some(SwapScript::Fill { tx_hash, output }) => Ok(VenueSwap {
                tx_hash,
                output_amount: output,
            }),
            Some(SwapScript::Transient(msg)) => Err(VenueError::Transient(msg)),
            Some(SwapScript::Rejected(msg)) => Err(VenueError::Rejected(msg)),
            None => Err(VenueError::Transient("no scripted swap".to_string())),
        }
    }

    async fn token_info(&self, address: &str) -> Result<TokenInfo, VenueError> {
        self.token
            .clone()
            .ok_or_else(|| VenueError::TokenNotFound(address.to_string()))
    }
}
