//! PostgreSQL store backend
//!
//! One pool, one repository struct implementing every store trait. Schema
//! is bootstrapped idempotently at startup; status transitions are CAS
//! updates (`WHERE id = $1 AND status = $2 ... RETURNING *`), so the row
//! lock inside the UPDATE is the serialization point per entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;
use tracing::info;

use super::{
    FollowerRule, MarketDataStore, NewTransaction, OrderFinalize, OrderStore, P2pPatch, P2pStore,
    StoreError, TransactionRecord, TransactionStore, User, UserStore,
};
use crate::core_types::{Network, OrderId, P2pOrderId, Token, UserId};
use crate::orders::{NewSpotOrder, OrderStatus, SpotOrder};
use crate::p2p::{
    NewP2pOrder, OpenOrderFilter, P2pMessage, P2pOrder, P2pSide, P2pStatus, P2pUserStats, Review,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS spot_orders (
    id                BIGSERIAL PRIMARY KEY,
    user_id           BIGINT NOT NULL,
    order_type        TEXT NOT NULL,
    network           TEXT NOT NULL,
    from_token        TEXT NOT NULL,
    to_token          TEXT NOT NULL,
    amount            NUMERIC NOT NULL,
    conditions        JSONB,
    status            TEXT NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    executed_at       TIMESTAMPTZ,
    cancelled_at      TIMESTAMPTZ,
    execution_details JSONB,
    error             TEXT
);
CREATE INDEX IF NOT EXISTS spot_orders_user_idx ON spot_orders (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS p2p_orders (
    id                BIGSERIAL PRIMARY KEY,
    maker_id          BIGINT NOT NULL,
    taker_id          BIGINT,
    side              TEXT NOT NULL,
    base_currency     TEXT NOT NULL,
    quote_currency    TEXT NOT NULL,
    crypto_amount     NUMERIC NOT NULL,
    price             NUMERIC NOT NULL,
    payment_method_id TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at        TIMESTAMPTZ NOT NULL,
    dispute_reason    TEXT
);
CREATE INDEX IF NOT EXISTS p2p_orders_status_idx ON p2p_orders (status, expires_at);

CREATE TABLE IF NOT EXISTS p2p_messages (
    id         BIGSERIAL PRIMARY KEY,
    order_id   BIGINT NOT NULL REFERENCES p2p_orders (id),
    sender_id  BIGINT NOT NULL,
    text       TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS p2p_reviews (
    order_id    BIGINT NOT NULL REFERENCES p2p_orders (id),
    reviewer_id BIGINT NOT NULL,
    subject_id  BIGINT NOT NULL,
    rating      SMALLINT NOT NULL,
    comment     TEXT,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (order_id, reviewer_id)
);

CREATE TABLE IF NOT EXISTS users (
    id             BIGINT PRIMARY KEY,
    username       TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_active_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    rating_count   BIGINT NOT NULL DEFAULT 0,
    rating_sum     BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS follower_rules (
    follower_id BIGINT NOT NULL,
    leader_id   BIGINT NOT NULL,
    ratio       NUMERIC NOT NULL,
    min_balance NUMERIC NOT NULL,
    active      BOOLEAN NOT NULL DEFAULT TRUE,
    PRIMARY KEY (follower_id, leader_id)
);

CREATE TABLE IF NOT EXISTS transactions (
    id         BIGSERIAL PRIMARY KEY,
    user_id    BIGINT NOT NULL,
    kind       TEXT NOT NULL,
    network    TEXT,
    asset      TEXT NOT NULL,
    amount     NUMERIC NOT NULL,
    tx_hash    TEXT,
    reference  TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS transactions_user_idx ON transactions (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS market_data (
    id        BIGSERIAL PRIMARY KEY,
    network   TEXT NOT NULL,
    token     TEXT NOT NULL,
    price     NUMERIC NOT NULL,
    polled_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS market_data_pair_idx ON market_data (network, token, polled_at DESC);
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create missing tables; safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Parse a stored enum through its serde string form.
fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        raw.to_string(),
    ))?)
}

fn map_spot_order(row: &PgRow) -> Result<SpotOrder, StoreError> {
    let conditions: Option<serde_json::Value> = row.try_get("conditions")?;
    let details: Option<serde_json::Value> = row.try_get("execution_details")?;
    Ok(SpotOrder {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        order_type: parse_enum(row.try_get::<String, _>("order_type")?.as_str())?,
        network: Network::new(row.try_get::<String, _>("network")?.as_str()),
        from_token: Token::new(row.try_get::<String, _>("from_token")?.as_str()),
        to_token: Token::new(row.try_get::<String, _>("to_token")?.as_str()),
        amount: row.try_get("amount")?,
        conditions: conditions.map(serde_json::from_value).transpose()?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        executed_at: row.try_get("executed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        execution_details: details.map(serde_json::from_value).transpose()?,
        error: row.try_get("error")?,
    })
}

fn map_p2p_order(row: &PgRow) -> Result<P2pOrder, StoreError> {
    Ok(P2pOrder {
        id: row.try_get("id")?,
        maker_id: row.try_get("maker_id")?,
        taker_id: row.try_get("taker_id")?,
        side: parse_enum(row.try_get::<String, _>("side")?.as_str())?,
        base_currency: Token::new(row.try_get::<String, _>("base_currency")?.as_str()),
        quote_currency: Token::new(row.try_get::<String, _>("quote_currency")?.as_str()),
        crypto_amount: row.try_get("crypto_amount")?,
        price: row.try_get("price")?,
        payment_method_id: row.try_get("payment_method_id")?,
        status: parse_enum(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        dispute_reason: row.try_get("dispute_reason")?,
    })
}

fn map_message(row: &PgRow) -> Result<P2pMessage, StoreError> {
    Ok(P2pMessage {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        sender_id: row.try_get("sender_id")?,
        text: row.try_get("text")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_review(row: &PgRow) -> Result<Review, StoreError> {
    let rating: i16 = row.try_get("rating")?;
    Ok(Review {
        order_id: row.try_get("order_id")?,
        reviewer_id: row.try_get("reviewer_id")?,
        subject_id: row.try_get("subject_id")?,
        rating: rating as u8,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_user(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        created_at: row.try_get("created_at")?,
        last_active_at: row.try_get("last_active_at")?,
        rating_count: row.try_get("rating_count")?,
        rating_sum: row.try_get("rating_sum")?,
    })
}

fn map_transaction(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    let network: Option<String> = row.try_get("network")?;
    Ok(TransactionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: parse_enum(row.try_get::<String, _>("kind")?.as_str())?,
        network: network.map(|n| Network::new(&n)),
        asset: Token::new(row.try_get::<String, _>("asset")?.as_str()),
        amount: row.try_get("amount")?,
        tx_hash: row.try_get("tx_hash")?,
        reference: row.try_get("reference")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, new: NewSpotOrder) -> Result<SpotOrder, StoreError> {
        let conditions = new
            .conditions
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let row = sqlx::query(
            r#"INSERT INTO spot_orders
               (user_id, order_type, network, from_token, to_token, amount, conditions, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING')
               RETURNING *"#,
        )
        .bind(new.user_id)
        .bind(new.order_type.to_string())
        .bind(new.network.as_str())
        .bind(new.from_token.as_str())
        .bind(new.to_token.as_str())
        .bind(new.amount)
        .bind(conditions)
        .fetch_one(&self.pool)
        .await?;
        map_spot_order(&row)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<SpotOrder>, StoreError> {
        let row = sqlx::query("SELECT * FROM spot_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_spot_order).transpose()
    }

    async fn list_user_orders(
        &self,
        user: UserId,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SpotOrder>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"SELECT * FROM spot_orders
                       WHERE user_id = $1 AND status = $2
                       ORDER BY created_at DESC LIMIT $3 OFFSET $4"#,
                )
                .bind(user)
                .bind(status.to_string())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"SELECT * FROM spot_orders
                       WHERE user_id = $1
                       ORDER BY created_at DESC LIMIT $2 OFFSET $3"#,
                )
                .bind(user)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(map_spot_order).collect()
    }

    async fn finalize_order(
        &self,
        id: OrderId,
        update: OrderFinalize,
    ) -> Result<Option<SpotOrder>, StoreError> {
        let details = update
            .execution_details
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let row = sqlx::query(
            r#"UPDATE spot_orders
               SET status = $2, executed_at = $3, cancelled_at = $4,
                   execution_details = $5, error = $6
               WHERE id = $1 AND status = 'PENDING'
               RETURNING *"#,
        )
        .bind(id)
        .bind(update.status.to_string())
        .bind(update.executed_at)
        .bind(update.cancelled_at)
        .bind(details)
        .bind(update.error)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_spot_order).transpose()
    }

    async fn list_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SpotOrder>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM spot_orders WHERE status = 'PENDING' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_spot_order).collect()
    }
}

#[async_trait]
impl P2pStore for PgStore {
    async fn insert_p2p(&self, new: NewP2pOrder) -> Result<P2pOrder, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO p2p_orders
               (maker_id, side, base_currency, quote_currency, crypto_amount,
                price, payment_method_id, status, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'OPEN', $8)
               RETURNING *"#,
        )
        .bind(new.maker_id)
        .bind(new.side.to_string())
        .bind(new.base_currency.as_str())
        .bind(new.quote_currency.as_str())
        .bind(new.crypto_amount)
        .bind(new.price)
        .bind(&new.payment_method_id)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await?;
        map_p2p_order(&row)
    }

    async fn get_p2p(&self, id: P2pOrderId) -> Result<Option<P2pOrder>, StoreError> {
        let row = sqlx::query("SELECT * FROM p2p_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_p2p_order).transpose()
    }

    async fn transition_p2p(
        &self,
        id: P2pOrderId,
        expect: P2pStatus,
        to: P2pStatus,
        patch: P2pPatch,
    ) -> Result<Option<P2pOrder>, StoreError> {
        let row = sqlx::query(
            r#"UPDATE p2p_orders
               SET status = $3,
                   taker_id = COALESCE($4, taker_id),
                   dispute_reason = COALESCE($5, dispute_reason)
               WHERE id = $1 AND status = $2
               RETURNING *"#,
        )
        .bind(id)
        .bind(expect.to_string())
        .bind(to.to_string())
        .bind(patch.taker_id)
        .bind(patch.dispute_reason)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_p2p_order).transpose()
    }

    async fn list_open(
        &self,
        side: P2pSide,
        filter: &OpenOrderFilter,
    ) -> Result<Vec<P2pOrder>, StoreError> {
        let order_clause = match side {
            P2pSide::Buy => "price ASC, created_at ASC",
            P2pSide::Sell => "price DESC, created_at ASC",
        };
        let sql = format!(
            r#"SELECT * FROM p2p_orders
               WHERE status = 'OPEN' AND side = $1
                 AND ($2::TEXT IS NULL OR base_currency = $2)
                 AND ($3::TEXT IS NULL OR quote_currency = $3)
                 AND ($4::TEXT IS NULL OR payment_method_id = $4)
               ORDER BY {order_clause}"#
        );
        let rows = sqlx::query(&sql)
            .bind(side.to_string())
            .bind(filter.base_currency.as_ref().map(|t| t.as_str().to_string()))
            .bind(
                filter
                    .quote_currency
                    .as_ref()
                    .map(|t| t.as_str().to_string()),
            )
            .bind(filter.payment_method_id.clone())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_p2p_order).collect()
    }

    async fn list_expired_open(&self, now: DateTime<Utc>) -> Result<Vec<P2pOrder>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM p2p_orders WHERE status = 'OPEN' AND expires_at <= $1")
                .bind(now)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(map_p2p_order).collect()
    }

    async fn list_by_status(&self, status: P2pStatus) -> Result<Vec<P2pOrder>, StoreError> {
        let rows = sqlx::query("SELECT * FROM p2p_orders WHERE status = $1")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_p2p_order).collect()
    }

    async fn list_user_p2p(&self, user: UserId) -> Result<Vec<P2pOrder>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM p2p_orders
               WHERE maker_id = $1 OR taker_id = $1
               ORDER BY created_at DESC"#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_p2p_order).collect()
    }

    async fn insert_message(
        &self,
        order_id: P2pOrderId,
        sender: UserId,
        text: &str,
    ) -> Result<P2pMessage, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO p2p_messages (order_id, sender_id, text)
               VALUES ($1, $2, $3) RETURNING *"#,
        )
        .bind(order_id)
        .bind(sender)
        .bind(text)
        .fetch_one(&self.pool)
        .await?;
        map_message(&row)
    }

    async fn list_messages(&self, order_id: P2pOrderId) -> Result<Vec<P2pMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM p2p_messages WHERE order_id = $1 ORDER BY created_at ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_message).collect()
    }

    async fn insert_review(&self, review: Review) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO p2p_reviews (order_id, reviewer_id, subject_id, rating, comment)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (order_id, reviewer_id) DO NOTHING"#,
        )
        .bind(review.order_id)
        .bind(review.reviewer_id)
        .bind(review.subject_id)
        .bind(review.rating as i16)
        .bind(review.comment)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate("review"));
        }
        Ok(())
    }

    async fn list_order_reviews(&self, order_id: P2pOrderId) -> Result<Vec<Review>, StoreError> {
        let rows = sqlx::query("SELECT * FROM p2p_reviews WHERE order_id = $1")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_review).collect()
    }

    async fn p2p_user_stats(&self, user: UserId) -> Result<P2pUserStats, StoreError> {
        let deals = sqlx::query(
            r#"SELECT
                 COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                 COUNT(*) FILTER (WHERE status = 'CANCELLED') AS cancelled
               FROM p2p_orders WHERE maker_id = $1 OR taker_id = $1"#,
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;

        let mut stats = P2pUserStats {
            completed_deals: deals.try_get::<i64, _>("completed")? as u64,
            cancelled_deals: deals.try_get::<i64, _>("cancelled")? as u64,
            ..Default::default()
        };
        // ratings come from the denormalized aggregate on the user row
        if let Some(row) = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?
        {
            let u = map_user(&row)?;
            stats.review_count = u.rating_count as u64;
            stats.average_rating = u.average_rating();
        }
        Ok(stats)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn upsert_user(&self, id: UserId, username: Option<&str>) -> Result<User, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO users (id, username)
               VALUES ($1, $2)
               ON CONFLICT (id) DO UPDATE
               SET username = COALESCE(EXCLUDED.username, users.username),
                   last_active_at = now()
               RETURNING *"#,
        )
        .bind(id)
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        map_user(&row)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_user).transpose()
    }

    async fn touch_activity(&self, id: UserId) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_active_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_active_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users WHERE last_active_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn list_user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM users").fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| r.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn add_rating(&self, user: UserId, rating: u8) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE users
               SET rating_count = rating_count + 1, rating_sum = rating_sum + $2
               WHERE id = $1"#,
        )
        .bind(user)
        .bind(rating as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn followers_of(&self, leader: UserId) -> Result<Vec<FollowerRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM follower_rules WHERE leader_id = $1 AND active = TRUE",
        )
        .bind(leader)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(FollowerRule {
                    follower_id: row.try_get("follower_id")?,
                    leader_id: row.try_get("leader_id")?,
                    ratio: row.try_get("ratio")?,
                    min_balance: row.try_get("min_balance")?,
                    active: row.try_get("active")?,
                })
            })
            .collect()
    }

    async fn upsert_follower_rule(&self, rule: FollowerRule) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO follower_rules (follower_id, leader_id, ratio, min_balance, active)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (follower_id, leader_id) DO UPDATE
               SET ratio = EXCLUDED.ratio,
                   min_balance = EXCLUDED.min_balance,
                   active = EXCLUDED.active"#,
        )
        .bind(rule.follower_id)
        .bind(rule.leader_id)
        .bind(rule.ratio)
        .bind(rule.min_balance)
        .bind(rule.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn record_transaction(
        &self,
        new: NewTransaction,
    ) -> Result<TransactionRecord, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO transactions (user_id, kind, network, asset, amount, tx_hash, reference)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(new.user_id)
        .bind(new.kind.as_str())
        .bind(new.network.as_ref().map(|n| n.as_str().to_string()))
        .bind(new.asset.as_str())
        .bind(new.amount)
        .bind(new.tx_hash)
        .bind(new.reference)
        .fetch_one(&self.pool)
        .await?;
        map_transaction(&row)
    }

    async fn list_user_transactions(
        &self,
        user: UserId,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM transactions
               WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"#,
        )
        .bind(user)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_transaction).collect()
    }
}

#[async_trait]
impl MarketDataStore for PgStore {
    async fn record_price(
        &self,
        network: &Network,
        token: &Token,
        price: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO market_data (network, token, price) VALUES ($1, $2, $3)")
            .bind(network.as_str())
            .bind(token.as_str())
            .bind(price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_price(
        &self,
        network: &Network,
        token: &Token,
    ) -> Result<Option<Decimal>, StoreError> {
        let row = sqlx::query(
            r#"SELECT price FROM market_data
               WHERE network = $1 AND token = $2
               ORDER BY polled_at DESC LIMIT 1"#,
        )
        .bind(network.as_str())
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("price").map_err(StoreError::from))
            .transpose()
    }
}
