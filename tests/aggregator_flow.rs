//! Aggregator flows exercised through the public API: best-price
//! selection across venues and the partial-fill swap cascade.

use rust_decimal::Decimal;
use std::sync::Arc;

use crossflow::cache::{CacheStore, MemoryCache};
use crossflow::core_types::{Network, Token};
use crossflow::dex::{AggregatorError, DexAggregator};
use crossflow::venue::{MockVenue, VenueClient};

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn aggregator(venues: Vec<MockVenue>) -> DexAggregator {
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
async fn best_price_selects_highest_output_and_penalizes_timeouts() {
    // A quotes 101, B quotes 103, C times out
    let agg = aggregator(vec![
        MockVenue::quoting("venue-a", d("101")),
        MockVenue::quoting("venue-b", d("103")),
        MockVenue::quote_timeout("venue-c"),
    ]);
    let quote = agg
        .best_price(
            &Network::new("TON"),
            &Token::new("TON"),
            &Token::new("USDT"),
            d("1"),
        )
        .await
        .unwrap();

    assert_eq!(quote.venue, "venue-b");
    assert_eq!(quote.output_amount, d("103"));
    assert_eq!(quote.input_amount, d("1"));

    // C picked up a failure mark and ranks below an untouched venue by
    // the deterministic name tie-break only, but below B once B succeeds
    agg.stats().record_success("TON", "venue-b");
    let ranked = agg
        .stats()
        .ranked("TON", &["venue-b".into(), "venue-c".into()]);
    assert_eq!(ranked, vec!["venue-b".to_string(), "venue-c".to_string()]);
}

#[tokio::test]
async fn partial_fill_cascades_to_second_venue_and_merges() {
    // both quote 1:1; B wins on rank, fills 60 of 100, A covers the rest
    let venue_b = MockVenue::quoting("venue-b", d("1")).fill("0xB1", d("60"));
    let venue_a = MockVenue::quoting("venue-a", d("1")).fill("0xA1", d("40"));
    let agg = aggregator(vec![venue_a, venue_b]);
    agg.stats().record_success("TON", "venue-b");

    let outcome = agg
        .execute_swap(
            &Network::new("TON"),
            &Token::new("TON"),
            &Token::new("USDT"),
            d("100"),
            100,
        )
        .await
        .unwrap();

    assert_eq!(outcome.output_amount, d("100"));
    assert_eq!(outcome.tx_hash, "0xB1");
    assert_eq!(outcome.additional_tx.as_deref(), Some("0xA1"));
    assert!(outcome.partial_execution);
    assert_eq!(outcome.input_amount, d("100"));
}

#[tokio::test]
async fn swap_either_meets_the_slippage_bound_or_fails_loud() {
    // the only venue refuses to fill: the caller sees AllVenuesFailed,
    // never a short fill below min_out
    let agg = aggregator(vec![
        MockVenue::quoting("venue-a", d("1")).fail_swap("liquidity gone"),
    ]);
    let err = agg
        .execute_swap(
            &Network::new("TON"),
            &Token::new("TON"),
            &Token::new("USDT"),
            d("50"),
            25,
        )
        .await
        .unwrap_err();
    match err {
        AggregatorError::AllVenuesFailed { details } => {
            assert_eq!(details.len(), 1);
            assert!(details[0].1.contains("liquidity gone"));
        }
        other => panic!("expected AllVenuesFailed, got {other}"),
    }
}
