//! Copy-trading dispatch
//!
//! Observer on the order-event bus: when a leader's order completes, every
//! active follower with sufficient balance gets a proportional MARKET
//! order. Followers are independent; one failing enqueue never blocks the
//! others, and no ordering is promised between follower executions.

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::OrderCompleted;
use crate::orders::{OrderEngine, OrderType};
use crate::store::UserStore;
use crate::wallet::WalletAdapter;

pub struct CopyTradeDispatcher {
    engine: Arc<OrderEngine>,
    users: Arc<dyn UserStore>,
    wallet: Arc<dyn WalletAdapter>,
}

impl CopyTradeDispatcher {
    pub fn new(
        engine: Arc<OrderEngine>,
        users: Arc<dyn UserStore>,
        wallet: Arc<dyn WalletAdapter>,
    ) -> Self {
        Self {
            engine,
            users,
            wallet,
        }
    }

    /// Consume completion events until shutdown.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<OrderCompleted>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("copy-trade dispatcher started");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            self.dispatch(&event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("copy-trade dispatcher lagged, dropped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("copy-trade dispatcher stopped");
        })
    }

    /// Fan one leader completion out to followers. Returns how many orders
    /// were enqueued.
    pub async fn dispatch(&self, event: &OrderCompleted) -> usize {
        let rules = match self.users.followers_of(event.user_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(leader = event.user_id, "follower lookup failed: {}", e);
                return 0;
            }
        };

        let mut enqueued = 0;
        for rule in rules {
            let amount = event.amount * rule.ratio;
            if amount <= Decimal::ZERO {
                continue;
            }
            let balance = match self
                .wallet
                .get_balance(rule.follower_id, &event.from_token)
                .await
            {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(follower = rule.follower_id, "balance check failed: {}", e);
                    continue;
                }
            };
            if balance < rule.min_balance {
                debug!(
                    follower = rule.follower_id,
                    %balance,
                    minimum = %rule.min_balance,
                    "skipping follower below minimum balance"
                );
                continue;
            }

            match self
                .engine
                .create_order(
                    rule.follower_id,
                    OrderType::Market,
                    event.network.clone(),
                    event.from_token.clone(),
                    event.to_token.clone(),
                    amount,
                    None,
                )
                .await
            {
                Ok(order) => {
                    info!(
                        follower = rule.follower_id,
                        leader = event.user_id,
                        order_id = order.id,
                        "copy trade enqueued"
                    );
                    enqueued += 1;
                }
                Err(e) => {
                    warn!(
                        follower = rule.follower_id,
                        leader = event.user_id,
                        "copy trade failed: {}",
                        e
                    );
                }
            }
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCache};
    use crate::core_types::{Network, Token};
    use crate::dex::DexAggregator;
    use crate::events::EventBus;
    use crate::notify::LogNotifier;
    use crate::store::{FollowerRule, MemoryStore, OrderStore};
    use crate::venue::{MockVenue, VenueClient};
    use crate::wallet::InMemoryWallet;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn rule(follower: i64, leader: i64, ratio: &str, min_balance: &str) -> FollowerRule {
        FollowerRule {
            follower_id: follower,
            leader_id: leader,
            ratio: d(ratio),
            min_balance: d(min_balance),
            active: true,
        }
    }

    fn completed_event(leader: i64, amount: &str) -> OrderCompleted {
        OrderCompleted {
            order_id: 1,
            user_id: leader,
            network: Network::new("TON"),
            from_token: Token::new("TON"),
            to_token: Token::new("USDT"),
            amount: d(amount),
            output_amount: d(amount),
            venue: "mock".into(),
        }
    }

    fn dispatcher_with(
        venue: MockVenue,
        wallet: Arc<InMemoryWallet>,
    ) -> (CopyTradeDispatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = MemoryCache::new();
        let aggregator = Arc::new(DexAggregator::with_clients(
            vec![(Network::new("TON"), Arc::new(venue) as Arc<dyn VenueClient>)],
            cache.clone() as Arc<dyn CacheStore>,
        ));
        let engine = Arc::new(OrderEngine::new(
            store.clone(),
            store.clone(),
            aggregator,
            cache,
            Arc::new(LogNotifier),
            EventBus::default(),
            50,
        ));
        (
            CopyTradeDispatcher::new(engine, store.clone(), wallet),
            store,
        )
    }

    #[tokio::test]
    async fn test_dispatch_sizes_follower_order_by_ratio() {
        let wallet = Arc::new(InMemoryWallet::new());
        wallet.deposit(2, &Token::new("TON"), d("100"));
        // leader traded 10; follower at ratio 0.5 trades 5 (quote 5x5=25)
        let (dispatcher, store) = dispatcher_with(
            MockVenue::quoting("mock", d("5")).fill("0xC1", d("25")),
            wallet,
        );
        dispatcher.users.upsert_user(2, None).await.unwrap();
        dispatcher
            .users
            .upsert_follower_rule(rule(2, 1, "0.5", "10"))
            .await
            .unwrap();

        let enqueued = dispatcher.dispatch(&completed_event(1, "10")).await;
        assert_eq!(enqueued, 1);
        let orders = store.list_user_orders(2, None, 10, 0).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].amount, d("5"));
    }

    #[tokio::test]
    async fn test_dispatch_skips_followers_below_minimum() {
        let wallet = Arc::new(InMemoryWallet::new());
        wallet.deposit(2, &Token::new("TON"), d("3"));
        let (dispatcher, store) =
            dispatcher_with(MockVenue::quoting("mock", d("5")), wallet);
        dispatcher
            .users
            .upsert_follower_rule(rule(2, 1, "0.5", "10"))
            .await
            .unwrap();

        assert_eq!(dispatcher.dispatch(&completed_event(1, "10")).await, 0);
        assert!(store.list_user_orders(2, None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_other_leaders() {
        let wallet = Arc::new(InMemoryWallet::new());
        wallet.deposit(2, &Token::new("TON"), d("100"));
        let (dispatcher, store) =
            dispatcher_with(MockVenue::quoting("mock", d("5")), wallet);
        dispatcher
            .users
            .upsert_follower_rule(rule(2, 99, "0.5", "10"))
            .await
            .unwrap();

        assert_eq!(dispatcher.dispatch(&completed_event(1, "10")).await, 0);
        assert!(store.list_user_orders(2, None, 10, 0).await.unwrap().is_empty());
    }
}
