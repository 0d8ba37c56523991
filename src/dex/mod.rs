//! DEX aggregator
//!
//! Fans quote requests out to every venue configured for a network, picks
//! the best route, and drives swap execution with reliability-ranked
//! fallback and a partial-fill cascade.

pub mod stats;

pub use stats::VenueStats;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheExt, CacheStore};
use crate::config::AppConfig;
use crate::core_types::{Network, Token};
use crate::money::{self, MoneyError};
use crate::venue::{HttpVenueClient, Quote, TokenInfo, VenueClient, VenueError};

/// Outer deadline for one quote fan-out.
const FANOUT_DEADLINE: Duration = Duration::from_secs(30);
/// Winning quotes are memoized for this long.
const QUOTE_TTL: Duration = Duration::from_secs(60);
/// Token metadata changes rarely.
const TOKEN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("unsupported network: {0}")]
    UnknownNetwork(String),

    #[error("token not found: {0}")]
    TokenNotFound(String),

    #[error("token lookup failed on every venue: {}", join_details(details))]
    TokenUnavailable { details: Vec<(String, String)> },

    #[error("no venue quoted the pair: {}", join_details(details))]
    NoQuote { details: Vec<(String, String)> },

    #[error("swap failed on every venue: {}", join_details(details))]
    AllVenuesFailed { details: Vec<(String, String)> },
}

fn join_details(details: &[(String, String)]) -> String {
    details
        .iter()
        .map(|(venue, err)| format!("{}: {}", venue, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Final result of `execute_swap`, possibly merged across two venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapOutcome {
    pub venue: String,
    pub tx_hash: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub input_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub output_amount: Decimal,
    pub route: Vec<Value>,
    pub partial_execution: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_tx: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct DexAggregator {
    /// Venue clients keyed by normalized network name.
    venues: FxHashMap<String, Vec<Arc<dyn VenueClient>>>,
    cache: Arc<dyn CacheStore>,
    stats: VenueStats,
}

impl DexAggregator {
    /// Build HTTP clients for every venue in the config.
    pub fn from_config(config: &AppConfig, cache: Arc<dyn CacheStore>) -> Self {
        let mut venues: FxHashMap<String, Vec<Arc<dyn VenueClient>>> = FxHashMap::default();
        for (network, urls) in &config.venue_urls {
            let net = Network::new(network);
            let clients = urls
                .iter()
                .map(|(name, url)| {
                    Arc::new(HttpVenueClient::new(name, net.as_str(), url))
                        as Arc<dyn VenueClient>
                })
                .collect();
            venues.insert(net.as_str().to_string(), clients);
        }
        Self {
            venues,
            cache,
            stats: VenueStats::new(),
        }
    }

    /// Wire pre-built clients (tests, alternative transports).
    pub fn with_clients(
        clients: Vec<(Network, Arc<dyn VenueClient>)>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let mut venues: FxHashMap<String, Vec<Arc<dyn VenueClient>>> = FxHashMap::default();
        for (network, client) in clients {
            venues
                .entry(network.as_str().to_string())
                .or_default()
                .push(client);
        }
        Self {
            venues,
            cache,
            stats: VenueStats::new(),
        }
    }

    pub fn stats(&self) -> &VenueStats {
        &self.stats
    }

    fn clients_for(
        &self,
        network: &Network,
    ) -> Result<&[Arc<dyn VenueClient>], AggregatorError> {
        self.venues
            .get(network.as_str())
            .filter(|v| !v.is_empty())
            .map(|v| v.as_slice())
            .ok_or_else(|| AggregatorError::UnknownNetwork(network.to_string()))
    }

    /// Best quote across all venues for `network` (C3 quote path).
    pub async fn best_price(
        &self,
        network: &Network,
        from: &Token,
        to: &Token,
        amount: Decimal,
    ) -> Result<Quote, AggregatorError> {
        money::ensure_positive(amount)?;
        let clients = self.clients_for(network)?;

        let cache_key = format!("quote:{}:{}:{}:{}", network, from, to, amount);
        match self.cache.get_json::<Quote>(&cache_key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => warn!("quote cache read failed: {}", e),
        }

        // Concurrent fan-out; a venue that misses the shared deadline is
        // counted as a timeout failure.
        let results = join_all(clients.iter().map(|client| async {
            let outcome =
                match tokio::time::timeout(FANOUT_DEADLINE, client.quote(from.as_str(), to.as_str(), amount))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(VenueError::Timeout),
                };
            (client.name().to_string(), outcome)
        }))
        .await;

        let mut best: Option<(String, crate::venue::VenueQuote)> = None;
        let mut details = Vec::new();
        for (venue, outcome) in results {
            match outcome {
                Ok(q) => {
                    let replace = match &best {
                        None => true,
                        Some((held_venue, held)) => {
                            let better = q.output_amount > held.output_amount;
                            let tied = q.output_amount == held.output_amount;
                            better
                                || (tied && self.preferred(network, &venue, held_venue))
                        }
                    };
                    if replace {
                        best = Some((venue, q));
                    }
                }
                Err(e) => {
                    self.stats.record_fail(network.as_str(), &venue);
                    details.push((venue, e.to_string()));
                }
            }
        }

        let (venue, vq) = best.ok_or(AggregatorError::NoQuote { details })?;
        let quote = Quote {
            venue,
            input_amount: amount,
            output_amount: vq.output_amount,
            route: vq.route,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.cache.set_json(&cache_key, &quote, QUOTE_TTL).await {
            warn!("quote cache write failed: {}", e);
        }
        Ok(quote)
    }

    /// Deterministic quote tie-break: ranking score descending, then venue
    /// name ascending.
    fn preferred(&self, network: &Network, challenger: &str, incumbent: &str) -> bool {
        let cs = self.stats.score(network.as_str(), challenger);
        let is = self.stats.score(network.as_str(), incumbent);
        cs > is || (cs == is && challenger < incumbent)
    }

    /// Swap `amount` of `from` into `to`, cascading across venues (C3 swap
    /// path). Output is never below the slippage bound of the quote the
    /// leg executed against.
    pub async fn execute_swap(
        &self,
        network: &Network,
        from: &Token,
        to: &Token,
        amount: Decimal,
        slippage_bps: u32,
    ) -> Result<SwapOutcome, AggregatorError> {
        self.execute_swap_inner(network, from, to, amount, slippage_bps)
            .await
    }

    fn execute_swap_inner<'a>(
        &'a self,
        network: &'a Network,
        from: &'a Token,
        to: &'a Token,
        amount: Decimal,
        slippage_bps: u32,
    ) -> BoxFuture<'a, Result<SwapOutcome, AggregatorError>> {
        Box::pin(async move {
            let quote = self.best_price(network, from, to, amount).await?;
            let min_out = money::min_output(quote.output_amount, slippage_bps)?;

            let clients = self.clients_for(network)?;
            let by_name: FxHashMap<&str, &Arc<dyn VenueClient>> =
                clients.iter().map(|c| (c.name(), c)).collect();
            let names: Vec<String> = clients.iter().map(|c| c.name().to_string()).collect();

            // Quote winner first, then the rest by reliability.
            let mut order = vec![quote.venue.clone()];
            for name in self.stats.ranked(network.as_str(), &names) {
                if name != quote.venue {
                    order.push(name);
                }
            }

            let mut details = Vec::new();
            for venue_name in order {
                let Some(client) = by_name.get(venue_name.as_str()) else {
                    continue;
                };
                match client
                    .swap(from.as_str(), to.as_str(), amount, min_out)
                    .await
                {
                    Ok(res) => {
                        self.stats.record_success(network.as_str(), &venue_name);

                        if res.output_amount >= quote.output_amount {
                            return Ok(SwapOutcome {
                                venue: venue_name,
                                tx_hash: res.tx_hash,
                                input_amount: amount,
                                output_amount: res.output_amount,
                                route: quote.route,
                                partial_execution: false,
                                additional_tx: None,
                                timestamp: Utc::now(),
                            });
                        }

                        // Partial fill: the venue delivered less than it
                        // quoted. Re-enter with the unfilled input share.
                        let filled_fraction = res.output_amount / quote.output_amount;
                        let remaining_in = amount * (Decimal::ONE - filled_fraction);
                        if remaining_in <= Decimal::ZERO {
                            return Ok(SwapOutcome {
                                venue: venue_name,
                                tx_hash: res.tx_hash,
                                input_amount: amount,
                                output_amount: res.output_amount,
                                route: quote.route,
                                partial_execution: false,
                                additional_tx: None,
                                timestamp: Utc::now(),
                            });
                        }
                        info!(
                            venue = %venue_name,
                            "partial fill: {} of {} out, re-routing {} in",
                            res.output_amount, quote.output_amount, remaining_in
                        );
                        let rest = self
                            .execute_swap_inner(network, from, to, remaining_in, slippage_bps)
                            .await?;
                        return Ok(SwapOutcome {
                            venue: venue_name,
                            tx_hash: res.tx_hash,
                            input_amount: amount,
                            output_amount: res.output_amount + rest.output_amount,
                            route: quote.route,
                            partial_execution: true,
                            additional_tx: Some(rest.tx_hash),
                            timestamp: Utc::now(),
                        });
                    }
                    Err(e) => {
                        warn!(venue = %venue_name, "swap attempt failed: {}", e);
                        self.stats.record_fail(network.as_str(), &venue_name);
                        details.push((venue_name, e.to_string()));
                    }
                }
            }
            Err(AggregatorError::AllVenuesFailed { details })
        })
    }

    /// Token metadata lookup, venue-ranked with fallback, cached 300 s.
    pub async fn token_info(
        &self,
        network: &Network,
        address: &str,
    ) -> Result<TokenInfo, AggregatorError> {
        let clients = self.clients_for(network)?;
        let cache_key = format!("token:{}:{}", network, address);
        match self.cache.get_json::<TokenInfo>(&cache_key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => warn!("token cache read failed: {}", e),
        }

        let names: Vec<String> = clients.iter().map(|c| c.name().to_string()).collect();
        let by_name: FxHashMap<&str, &Arc<dyn VenueClient>> =
            clients.iter().map(|c| (c.name(), c)).collect();

        let mut details = Vec::new();
        for venue_name in self.stats.ranked(network.as_str(), &names) {
            let Some(client) = by_name.get(venue_name.as_str()) else {
                continue;
            };
            match client.token_info(address).await {
                Ok(info) => {
                    if let Err(e) = self.cache.set_json(&cache_key, &info, TOKEN_TTL).await {
                        warn!("token cache write failed: {}", e);
                    }
                    return Ok(info);
                }
                Err(VenueError::TokenNotFound(_)) => {
                    return Err(AggregatorError::TokenNotFound(address.to_string()));
                }
                Err(e) => details.push((venue_name, e.to_string())),
            }
        }
        Err(AggregatorError::TokenUnavailable { details })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::venue::MockVenue;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn agg(venues: Vec<MockVenue>) -> DexAggregator {
        let net = Network::new("TON");
        DexAggregator::with_clients(
            venues
                .into_iter()
                .map(|v| (net.clone(), Arc::new(v) as Arc<dyn VenueClient>))
                .collect(),
            MemoryCache::new() as Arc<dyn CacheStore>,
        )
    }

    #[tokio::test]
    async fn test_best_price_picks_max_output_and_marks_failures() {
        let aggregator = agg(vec![
            MockVenue::quoting("venue-a", d("101")),
            MockVenue::quoting("venue-b", d("103")),
            MockVenue::quote_timeout("venue-c"),
        ]);
        let net = Network::new("TON");
        let quote = aggregator
            .best_price(&net, &Token::new("TON"), &Token::new("USDT"), d("1"))
            .await
            .unwrap();
        assert_eq!(quote.venue, "venue-b");
        assert_eq!(quote.output_amount, d("103"));
        // the timed-out venue got a fail mark
        assert_eq!(aggregator.stats().score("TON", "venue-c"), 0.0);
        assert!(
            aggregator
                .stats()
                .ranked("TON", &["venue-b".into(), "venue-c".into()])
                .first()
                .is_some_and(|v| v == "venue-b")
        );
    }

    #[tokio::test]
    async fn test_best_price_tie_breaks_by_ranking_then_name() {
        let aggregator = agg(vec![
            MockVenue::quoting("zeta", d("100")),
            MockVenue::quoting("alpha", d("100")),
        ]);
        let net = Network::new("TON");
        // equal scores: lexicographically smaller name wins
        let quote = aggregator
            .best_price(&net, &Token::new("TON"), &Token::new("USDT"), d("1"))
            .await
            .unwrap();
        assert_eq!(quote.venue, "alpha");

        // give zeta a better score and requote with a fresh aggregator
        let aggregator = agg(vec![
            MockVenue::quoting("zeta", d("100")),
            MockVenue::quoting("alpha", d("100")),
        ]);
        aggregator.stats().record_success("TON", "zeta");
        let quote = aggregator
            .best_price(&net, &Token::new("TON"), &Token::new("USDT"), d("1"))
            .await
            .unwrap();
        assert_eq!(quote.venue, "zeta");
    }

    #[tokio::test]
    async fn test_best_price_uses_cache_on_second_call() {
        let aggregator = agg(vec![MockVenue::quoting("venue-a", d("50"))]);
        let net = Network::new("TON");
        let from = Token::new("TON");
        let to = Token::new("USDT");
        let first = aggregator.best_price(&net, &from, &to, d("2")).await.unwrap();
        let second = aggregator.best_price(&net, &from, &to, d("2")).await.unwrap();
        assert_eq!(first.timestamp, second.timestamp);
    }

    #[tokio::test]
    async fn test_best_price_no_quote_lists_every_venue_error() {
        let aggregator = agg(vec![
            MockVenue::quote_pair_not_found("venue-a"),
            MockVenue::quote_transient("venue-b", "503"),
        ]);
        let net = Network::new("TON");
        let err = aggregator
            .best_price(&net, &Token::new("TON"), &Token::new("USDT"), d("1"))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("venue-a"));
        assert!(msg.contains("venue-b"));
    }

    #[tokio::test]
    async fn test_best_price_rejects_non_positive_amount() {
        let aggregator = agg(vec![MockVenue::quoting("venue-a", d("1"))]);
        let net = Network::new("TON");
        let err = aggregator
            .best_price(&net, &Token::new("TON"), &Token::new("USDT"), d("0"))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::Money(_)));
    }

    #[tokio::test]
    async fn test_execute_swap_full_fill() {
        let aggregator = agg(vec![MockVenue::quoting("venue-a", d("1")).fill("0xA1", d("100"))]);
        let net = Network::new("TON");
        let out = aggregator
            .execute_swap(&net, &Token::new("TON"), &Token::new("USDT"), d("100"), 50)
            .await
            .unwrap();
        assert!(!out.partial_execution);
        assert_eq!(out.tx_hash, "0xA1");
        assert_eq!(out.output_amount, d("100"));
        assert!(out.additional_tx.is_none());
    }

    #[tokio::test]
    async fn test_execute_swap_partial_fill_cascades() {
        // venue-b quotes best and fills 60 of 100; venue-a takes the
        // remaining 40 in the recursive pass.
        let venue_b = MockVenue::quoting("venue-b", d("1")).fill("0xB1", d("60"));
        let venue_a = MockVenue::quoting("venue-a", d("1")).fill("0xA1", d("40"));
        // make venue-b the ranked winner for the first leg, and make the
        // second leg skip it (no more scripted swaps -> transient error).
        let aggregator = agg(vec![venue_a, venue_b]);
        aggregator.stats().record_success("TON", "venue-b");

        let net = Network::new("TON");
        let out = aggregator
            .execute_swap(&net, &Token::new("TON"), &Token::new("USDT"), d("100"), 100)
            .await
            .unwrap();
        assert!(out.partial_execution);
        assert_eq!(out.tx_hash, "0xB1");
        assert_eq!(out.additional_tx.as_deref(), Some("0xA1"));
        assert_eq!(out.output_amount, d("100"));
    }

    #[tokio::test]
    async fn test_execute_swap_all_venues_failed() {
        let aggregator =
            agg(vec![MockVenue::quoting("venue-a", d("1")).fail_swap("pool drained")]);
        let net = Network::new("TON");
        let err = aggregator
            .execute_swap(&net, &Token::new("TON"), &Token::new("USDT"), d("100"), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::AllVenuesFailed { .. }));
        // the failure counted against the venue
        assert_eq!(aggregator.stats().score("TON", "venue-a"), 0.0);
    }
}
