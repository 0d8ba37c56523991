//! In-memory store backend
//!
//! Single-process implementation of every repository trait. A coarse
//! `RwLock` per table keeps compare-and-set transitions atomic; write
//! volume here is human-scale, not matching-engine-scale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{
    FollowerRule, MarketDataStore, NewTransaction, OrderFinalize, OrderStore, P2pPatch, P2pStore,
    StoreError, TransactionRecord, TransactionStore, User, UserStore,
};
use crate::core_types::{Network, OrderId, P2pOrderId, Token, UserId};
use crate::orders::{NewSpotOrder, OrderStatus, SpotOrder};
use crate::p2p::{
    NewP2pOrder, OpenOrderFilter, P2pMessage, P2pOrder, P2pSide, P2pStatus, P2pUserStats, Review,
};

#[derive(Default)]
struct OrdersTable {
    next_id: OrderId,
    rows: BTreeMap<OrderId, SpotOrder>,
}

#[derive(Default)]
struct P2pTable {
    next_id: P2pOrderId,
    rows: BTreeMap<P2pOrderId, P2pOrder>,
    next_message_id: i64,
    messages: Vec<P2pMessage>,
    reviews: Vec<Review>,
}

#[derive(Default)]
struct UsersTable {
    rows: BTreeMap<UserId, User>,
    follower_rules: Vec<FollowerRule>,
}

#[derive(Default)]
struct TxTable {
    next_id: i64,
    rows: Vec<TransactionRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    orders: RwLock<OrdersTable>,
    p2p: RwLock<P2pTable>,
    users: RwLock<UsersTable>,
    txs: RwLock<TxTable>,
    market: RwLock<BTreeMap<(String, String), Vec<(Decimal, DateTime<Utc>)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, new: NewSpotOrder) -> Result<SpotOrder, StoreError> {
        let mut table = self.orders.write().await;
        table.next_id += 1;
        let order = SpotOrder {
            id: table.next_id,
            user_id: new.user_id,
            order_type: new.order_type,
            network: new.network,
            from_token: new.from_token,
            to_token: new.to_token,
            amount: new.amount,
            conditions: new.conditions,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            executed_at: None,
            cancelled_at: None,
            execution_details: None,
            error: None,
        };
        table.rows.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<SpotOrder>, StoreError> {
        Ok(self.orders.read().await.rows.get(&id).cloned())
    }

    async fn list_user_orders(
        &self,
        user: UserId,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SpotOrder>, StoreError> {
        let table = self.orders.read().await;
        let mut rows: Vec<SpotOrder> = table
            .rows
            .values()
            .filter(|o| o.user_id == user)
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn finalize_order(
        &self,
        id: OrderId,
        update: OrderFinalize,
    ) -> Result<Option<SpotOrder>, StoreError> {
        let mut table = self.orders.write().await;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != OrderStatus::Pending {
            return Ok(None);
        }
        row.status = update.status;
        row.executed_at = update.executed_at;
        row.cancelled_at = update.cancelled_at;
        row.execution_details = update.execution_details;
        row.error = update.error;
        Ok(Some(row.clone()))
    }

    async fn list_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SpotOrder>, StoreError> {
        let table = self.orders.read().await;
        Ok(table
            .rows
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.created_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl P2pStore for MemoryStore {
    async fn insert_p2p(&self, new: NewP2pOrder) -> Result<P2pOrder, StoreError> {
        let mut table = self.p2p.write().await;
        table.next_id += 1;
        let order = P2pOrder {
            id: table.next_id,
            maker_id: new.maker_id,
            taker_id: None,
            side: new.side,
            base_currency: new.base_currency,
            quote_currency: new.quote_currency,
            crypto_amount: new.crypto_amount,
            price: new.price,
            payment_method_id: new.payment_method_id,
            status: P2pStatus::Open,
            created_at: Utc::now(),
            expires_at: new.expires_at,
            dispute_reason: None,
        };
        table.rows.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_p2p(&self, id: P2pOrderId) -> Result<Option<P2pOrder>, StoreError> {
        Ok(self.p2p.read().await.rows.get(&id).cloned())
    }

    async fn transition_p2p(
        &self,
        id: P2pOrderId,
        expect: P2pStatus,
        to: P2pStatus,
        patch: P2pPatch,
    ) -> Result<Option<P2pOrder>, StoreError> {
        let mut table = self.p2p.write().await;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != expect {
            return Ok(None);
        }
        row.status = to;
        if let Some(taker) = patch.taker_id {
            row.taker_id = Some(taker);
        }
        if let Some(reason) = patch.dispute_reason {
            row.dispute_reason = Some(reason);
        }
        Ok(Some(row.clone()))
    }

    async fn list_open(
        &self,
        side: P2pSide,
        filter: &OpenOrderFilter,
    ) -> Result<Vec<P2pOrder>, StoreError> {
        let table = self.p2p.read().await;
        let mut rows: Vec<P2pOrder> = table
            .rows
            .values()
            .filter(|o| o.status == P2pStatus::Open && o.side == side)
            .filter(|o| {
                filter
                    .base_currency
                    .as_ref()
                    .is_none_or(|t| &o.base_currency == t)
            })
            .filter(|o| {
                filter
                    .quote_currency
                    .as_ref()
                    .is_none_or(|t| &o.quote_currency == t)
            })
            .filter(|o| {
                filter
                    .payment_method_id
                    .as_ref()
                    .is_none_or(|m| &o.payment_method_id == m)
            })
            .cloned()
            .collect();
        // buyers shop cheap ads first; sellers shop expensive ones
        rows.sort_by(|a, b| {
            let by_price = match side {
                P2pSide::Buy => a.price.cmp(&b.price),
                P2pSide::Sell => b.price.cmp(&a.price),
            };
            by_price.then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(rows)
    }

    async fn list_expired_open(&self, now: DateTime<Utc>) -> Result<Vec<P2pOrder>, StoreError> {
        let table = self.p2p.read().await;
        Ok(table
            .rows
            .values()
            .filter(|o| o.status == P2pStatus::Open && o.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: P2pStatus) -> Result<Vec<P2pOrder>, StoreError> {
        let table = self.p2p.read().await;
        Ok(table
            .rows
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect())
    }

    async fn list_user_p2p(&self, user: UserId) -> Result<Vec<P2pOrder>, StoreError> {
        let table = self.p2p.read().await;
        let mut rows: Vec<P2pOrder> = table
            .rows
            .values()
            .filter(|o| o.maker_id == user || o.taker_id == Some(user))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn insert_message(
        &self,
        order_id: P2pOrderId,
        sender: UserId,
        text: &str,
    ) -> Result<P2pMessage, StoreError> {
        let mut table = self.p2p.write().await;
        table.next_message_id += 1;
        let message = P2pMessage {
            id: table.next_message_id,
            order_id,
            sender_id: sender,
            text: text.to_string(),
            created_at: Utc::now(),
        };
        table.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, order_id: P2pOrderId) -> Result<Vec<P2pMessage>, StoreError> {
        let table = self.p2p.read().await;
        Ok(table
            .messages
            .iter()
            .filter(|m| m.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn insert_review(&self, review: Review) -> Result<(), StoreError> {
        let mut table = self.p2p.write().await;
        if table
            .reviews
            .iter()
            .any(|r| r.order_id == review.order_id && r.reviewer_id == review.reviewer_id)
        {
            return Err(StoreError::Duplicate("review"));
        }
        table.reviews.push(review);
        Ok(())
    }

    async fn list_order_reviews(&self, order_id: P2pOrderId) -> Result<Vec<Review>, StoreError> {
        let table = self.p2p.read().await;
        Ok(table
            .reviews
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn p2p_user_stats(&self, user: UserId) -> Result<P2pUserStats, StoreError> {
        let table = self.p2p.read().await;
        let mut stats = P2pUserStats::default();
        for order in table.rows.values() {
            if !(order.maker_id == user || order.taker_id == Some(user)) {
                continue;
            }
            match order.status {
                P2pStatus::Completed => stats.completed_deals += 1,
                P2pStatus::Cancelled => stats.cancelled_deals += 1,
                _ => {}
            }
        }
        drop(table);

        // ratings come from the denormalized aggregate on the user row
        if let Some(u) = self.users.read().await.rows.get(&user) {
            stats.review_count = u.rating_count as u64;
            stats.average_rating = u.average_rating();
        }
        Ok(stats)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn upsert_user(&self, id: UserId, username: Option<&str>) -> Result<User, StoreError> {
        let mut table = self.users.write().await;
        let now = Utc::now();
        let user = table
            .rows
            .entry(id)
            .and_modify(|u| {
                if let Some(name) = username {
                    u.username = Some(name.to_string());
                }
                u.last_active_at = now;
            })
            .or_insert_with(|| User {
                id,
                username: username.map(str::to_string),
                created_at: now,
                last_active_at: now,
                rating_count: 0,
                rating_sum: 0,
            });
        Ok(user.clone())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.rows.get(&id).cloned())
    }

    async fn touch_activity(&self, id: UserId) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().await.rows.get_mut(&id) {
            user.last_active_at = Utc::now();
        }
        Ok(())
    }

    async fn count_active_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .rows
            .values()
            .filter(|u| u.last_active_at >= since)
            .count() as u64)
    }

    async fn list_user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        Ok(self.users.read().await.rows.keys().copied().collect())
    }

    async fn add_rating(&self, user: UserId, rating: u8) -> Result<(), StoreError> {
        let mut table = self.users.write().await;
        if let Some(u) = table.rows.get_mut(&user) {
            u.rating_count += 1;
            u.rating_sum += rating as i64;
        }
        Ok(())
    }

    async fn followers_of(&self, leader: UserId) -> Result<Vec<FollowerRule>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .follower_rules
            .iter()
            .filter(|r| r.leader_id == leader && r.active)
            .cloned()
            .collect())
    }

    async fn upsert_follower_rule(&self, rule: FollowerRule) -> Result<(), StoreError> {
        let mut table = self.users.write().await;
        if let Some(existing) = table
            .follower_rules
            .iter_mut()
            .find(|r| r.follower_id == rule.follower_id && r.leader_id == rule.leader_id)
        {
            *existing = rule;
        } else {
            table.follower_rules.push(rule);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn record_transaction(
        &self,
        new: NewTransaction,
    ) -> Result<TransactionRecord, StoreError> {
        let mut table = self.txs.write().await;
        table.next_id += 1;
        let record = TransactionRecord {
            id: table.next_id,
            user_id: new.user_id,
            kind: new.kind,
            network: new.network,
            asset: new.asset,
            amount: new.amount,
            tx_hash: new.tx_hash,
            reference: new.reference,
            created_at: Utc::now(),
        };
        table.rows.push(record.clone());
        Ok(record)
    }

    async fn list_user_transactions(
        &self,
        user: UserId,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let table = self.txs.read().await;
        let mut rows: Vec<TransactionRecord> = table
            .rows
            .iter()
            .filter(|t| t.user_id == user)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl MarketDataStore for MemoryStore {
    async fn record_price(
        &self,
        network: &Network,
        token: &Token,
        price: Decimal,
    ) -> Result<(), StoreError> {
        let mut table = self.market.write().await;
        table
            .entry((network.as_str().to_string(), token.as_str().to_string()))
            .or_default()
            .push((price, Utc::now()));
        Ok(())
    }

    async fn latest_price(
        &self,
        network: &Network,
        token: &Token,
    ) -> Result<Option<Decimal>, StoreError> {
        let table = self.market.read().await;
        Ok(table
            .get(&(network.as_str().to_string(), token.as_str().to_string()))
            .and_then(|points| points.last().map(|(p, _)| *p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Token;
    use crate::orders::OrderType;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn new_order(user: UserId) -> NewSpotOrder {
        NewSpotOrder {
            user_id: user,
            order_type: OrderType::Market,
            network: Network::new("TON"),
            from_token: Token::new("TON"),
            to_token: Token::new("USDT"),
            amount: d("1"),
            conditions: None,
        }
    }

    fn new_ad(maker: UserId, side: P2pSide, price: &str) -> NewP2pOrder {
        NewP2pOrder {
            maker_id: maker,
            side,
            base_currency: Token::new("TON"),
            quote_currency: Token::new("USDT"),
            crypto_amount: d("10"),
            price: d(price),
            payment_method_id: "bank".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn test_order_ids_are_monotonic() {
        let store = MemoryStore::new();
        let a = store.insert_order(new_order(1)).await.unwrap();
        let b = store.insert_order(new_order(1)).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_finalize_order_cas_single_winner() {
        let store = MemoryStore::new();
        let order = store.insert_order(new_order(1)).await.unwrap();
        let won = store
            .finalize_order(order.id, OrderFinalize::cancelled())
            .await
            .unwrap();
        assert!(won.is_some());
        let lost = store
            .finalize_order(order.id, OrderFinalize::failed("late".into()))
            .await
            .unwrap();
        assert!(lost.is_none());
        let row = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_open_sorts_buy_ads_price_ascending() {
        let store = MemoryStore::new();
        store.insert_p2p(new_ad(1, P2pSide::Buy, "5.2")).await.unwrap();
        store.insert_p2p(new_ad(2, P2pSide::Buy, "5.0")).await.unwrap();
        store.insert_p2p(new_ad(3, P2pSide::Sell, "9.9")).await.unwrap();
        let ads = store
            .list_open(P2pSide::Buy, &OpenOrderFilter::default())
            .await
            .unwrap();
        assert_eq!(ads.len(), 2);
        assert_eq!(ads[0].price, d("5.0"));
    }

    #[tokio::test]
    async fn test_list_open_sorts_sell_ads_price_descending() {
        let store = MemoryStore::new();
        store.insert_p2p(new_ad(1, P2pSide::Sell, "5.0")).await.unwrap();
        store.insert_p2p(new_ad(2, P2pSide::Sell, "5.5")).await.unwrap();
        let ads = store
            .list_open(P2pSide::Sell, &OpenOrderFilter::default())
            .await
            .unwrap();
        assert_eq!(ads[0].price, d("5.5"));
    }

    #[tokio::test]
    async fn test_review_unique_per_reviewer() {
        let store = MemoryStore::new();
        let review = Review {
            order_id: 1,
            reviewer_id: 2,
            subject_id: 3,
            rating: 5,
            comment: None,
            created_at: Utc::now(),
        };
        store.insert_review(review.clone()).await.unwrap();
        assert!(matches!(
            store.insert_review(review).await,
            Err(StoreError::Duplicate("review"))
        ));
    }

    #[tokio::test]
    async fn test_user_stats_aggregates() {
        let store = MemoryStore::new();
        store.upsert_user(1, None).await.unwrap();
        let ad = store.insert_p2p(new_ad(1, P2pSide::Sell, "5")).await.unwrap();
        store
            .transition_p2p(
                ad.id,
                P2pStatus::Open,
                P2pStatus::InProgress,
                P2pPatch {
                    taker_id: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .transition_p2p(
                ad.id,
                P2pStatus::InProgress,
                P2pStatus::Completed,
                P2pPatch::default(),
            )
            .await
            .unwrap();
        // review row and denormalized aggregate land together
        store
            .insert_review(Review {
                order_id: ad.id,
                reviewer_id: 2,
                subject_id: 1,
                rating: 4,
                comment: Some("smooth".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.add_rating(1, 4).await.unwrap();

        let stats = store.p2p_user_stats(1).await.unwrap();
        assert_eq!(stats.completed_deals, 1);
        assert_eq!(stats.review_count, 1);
        assert_eq!(stats.average_rating, Some(d("4")));
    }
}
