//! Trigger watcher
//!
//! One cooperative task per process. Every second it walks the watched
//! (network, from_token) pairs, prices each against the network's
//! reference symbol, and fires any conditional order whose trigger the
//! price crossed. Firing goes through `OrderEngine::execute`, so the
//! terminal-state CAS makes concurrent firings harmless. Non-fatal
//! failures are logged and retried on the next tick, never propagated.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::engine::{OrderEngine, TRACKING_PAIRS_KEY, TrackedOrder, tracking_hash_key};
use crate::cache::{CacheExt, CacheStore};
use crate::config::AppConfig;
use crate::core_types::{Network, Token};
use crate::dex::DexAggregator;
use crate::store::MarketDataStore;
use rust_decimal::Decimal;

pub struct TriggerWatcher {
    engine: Arc<OrderEngine>,
    aggregator: Arc<DexAggregator>,
    cache: Arc<dyn CacheStore>,
    market: Arc<dyn MarketDataStore>,
    config: Arc<AppConfig>,
    tick: Duration,
}

impl TriggerWatcher {
    pub fn new(
        engine: Arc<OrderEngine>,
        aggregator: Arc<DexAggregator>,
        cache: Arc<dyn CacheStore>,
        market: Arc<dyn MarketDataStore>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            engine,
            aggregator,
            cache,
            market,
            config,
            tick: Duration::from_secs(1),
        }
    }

    /// Poll until shutdown; instantaneous at the next tick boundary.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("trigger watcher started");
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let fired = self.tick_once().await;
                    if fired > 0 {
                        debug!("trigger tick fired {} orders", fired);
                    }
                }
                _ = shutdown.changed() => {
                    info!("trigger watcher stopping");
                    break;
                }
            }
        }
    }

    /// One full pass over the trigger index. Returns how many orders fired.
    pub async fn tick_once(&self) -> usize {
        let pairs = match self.cache.smembers(TRACKING_PAIRS_KEY).await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("trigger index unavailable: {}", e);
                return 0;
            }
        };

        let mut fired = 0;
        for member in pairs {
            let Some(raw) = member.as_str() else { continue };
            let Some((network, token)) = raw.split_once(':') else {
                warn!("malformed tracking pair entry: {}", raw);
                continue;
            };
            let network = Network::new(network);
            let token = Token::new(token);
            fired += self.evaluate_pair(&network, &token).await;
        }
        fired
    }

    async fn evaluate_pair(&self, network: &Network, token: &Token) -> usize {
        let reference = Token::new(&self.config.price_reference_for(network));
        let current_price = match self
            .aggregator
            .best_price(network, token, &reference, Decimal::ONE)
            .await
        {
            Ok(quote) => quote.output_amount,
            Err(e) => {
                // transient: the pair stays watched, next tick retries
                warn!(%network, %token, "price poll failed: {}", e);
                return 0;
            }
        };

        if let Err(e) = self.market.record_price(network, token, current_price).await {
            warn!(%network, %token, "market data write failed: {}", e);
        }

        let key = tracking_hash_key(network, token);
        let tracked: Vec<(String, TrackedOrder)> = match self.cache.hgetall_json(&key).await {
            Ok(tracked) => tracked,
            Err(e) => {
                warn!(%network, %token, "trigger index read failed: {}", e);
                return 0;
            }
        };

        let mut fired = 0;
        for (_, entry) in tracked {
            if !entry.direction.fires(current_price, entry.trigger_price) {
                continue;
            }
            info!(
                order_id = entry.order_id,
                %current_price,
                trigger = %entry.trigger_price,
                "trigger crossed, executing"
            );
            match self.engine.execute(entry.order_id).await {
                Ok(_) => fired += 1,
                // the engine already moved the order (and the index) to its
                // terminal state; anything else retries next tick
                Err(e) => warn!(order_id = entry.order_id, "triggered execution failed: {}", e),
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::events::EventBus;
    use crate::notify::LogNotifier;
    use crate::orders::{OrderConditions, OrderStatus, OrderType, TriggerDirection};
    use crate::store::{MemoryStore, OrderStore};
    use crate::venue::{MockVenue, VenueClient};
    use rustc_hash::FxHashMap;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn test_config() -> Arc<AppConfig> {
        let mut venues = FxHashMap::default();
        let mut ton = FxHashMap::default();
        ton.insert("mock".to_string(), "http://unused".to_string());
        venues.insert("TON".to_string(), ton);
        Arc::new(AppConfig {
            venue_urls: venues,
            fees: Default::default(),
            price_reference: FxHashMap::default(),
            database_url: None,
            metrics_addr: "127.0.0.1:0".into(),
            backup_dir: "/tmp".into(),
            backup_token: None,
            bot_token: None,
            encryption_key: None,
            log: crate::config::LogConfig {
                log_dir: "/tmp".into(),
                log_file: "test.log".into(),
                rotation: "never".into(),
                log_level: "info".into(),
                use_json: false,
            },
        })
    }

    fn watcher_with(venue: MockVenue) -> (TriggerWatcher, Arc<OrderEngine>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = MemoryCache::new();
        let net = Network::new("TON");
        let aggregator = Arc::new(DexAggregator::with_clients(
            vec![(net, Arc::new(venue) as Arc<dyn VenueClient>)],
            cache.clone() as Arc<dyn CacheStore>,
        ));
        let engine = Arc::new(OrderEngine::new(
            store.clone(),
            store.clone(),
            aggregator.clone(),
            cache.clone(),
            Arc::new(LogNotifier),
            EventBus::default(),
            50,
        ));
        let watcher = TriggerWatcher::new(
            engine.clone(),
            aggregator,
            cache,
            store.clone(),
            test_config(),
        );
        (watcher, engine, store)
    }

    async fn create_stop_loss(engine: &OrderEngine, trigger: &str) -> crate::orders::SpotOrder {
        engine
            .create_order(
                1,
                OrderType::StopLoss,
                Network::new("TON"),
                Token::new("SOL"),
                Token::new("USDT"),
                d("1"),
                Some(OrderConditions {
                    trigger_price: d(trigger),
                    direction: TriggerDirection::StopLoss,
                }),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_fire_while_price_above_trigger() {
        // price 100, stop loss at 95
        let (watcher, engine, store) = watcher_with(MockVenue::quoting("mock", d("100")));
        let order = create_stop_loss(&engine, "95").await;

        assert_eq!(watcher.tick_once().await, 0);
        let row = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Pending);

        // price got recorded for the watched pair
        let last = store
            .latest_price(&Network::new("TON"), &Token::new("SOL"))
            .await
            .unwrap();
        assert_eq!(last, Some(d("100")));
    }

    #[tokio::test]
    async fn test_stop_loss_fires_when_price_crosses() {
        // price 94 crosses the 95 trigger; the fill matches the quote
        let (watcher, engine, store) =
            watcher_with(MockVenue::quoting("mock", d("94")).fill("0xF1", d("94")));
        let order = create_stop_loss(&engine, "95").await;

        assert_eq!(watcher.tick_once().await, 1);
        let row = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Completed);
        assert!(row.execution_details.is_some());

        // second tick: pair is gone from the index, nothing fires
        assert_eq!(watcher.tick_once().await, 0);
        let row = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_take_profit_direction() {
        assert!(TriggerDirection::TakeProfit.fires(d("101"), d("100")));
        assert!(!TriggerDirection::TakeProfit.fires(d("99"), d("100")));
        assert!(TriggerDirection::StopLoss.fires(d("94"), d("95")));
        assert!(!TriggerDirection::StopLoss.fires(d("96"), d("95")));
    }

    #[tokio::test]
    async fn test_price_poll_failure_keeps_order_tracked() {
        let (watcher, engine, _) = watcher_with(MockVenue::quote_transient("mock", "down"));
        create_stop_loss(&engine, "95").await;

        assert_eq!(watcher.tick_once().await, 0);
        // pair still watched for the next tick
        let pairs = watcher.cache.smembers(TRACKING_PAIRS_KEY).await.unwrap();
        assert_eq!(pairs.len(), 1);
    }
}
