//! In-memory cache backend
//!
//! DashMap-sharded store with lazy expiry on read and a 1 s background
//! sweeper. Per-key atomicity comes from the shard lock held by the
//! DashMap entry API; no operation spans two keys.

use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
enum Kind {
    Plain(Value),
    Counter(i64),
    Set(Vec<Value>),
    List(VecDeque<Value>),
    Hash(FxHashMap<String, Value>),
}

#[derive(Debug, Clone)]
struct Slot {
    kind: Kind,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(kind: Kind) -> Self {
        Self { kind, expires_at: None }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryCache {
    slots: DashMap<String, Slot>,
}

impl MemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: DashMap::new() })
    }

    /// Spawn the expiry sweeper. Runs every second until `shutdown` flips.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = Instant::now();
                        let before = cache.slots.len();
                        cache.slots.retain(|_, slot| !slot.expired(now));
                        let removed = before - cache.slots.len();
                        if removed > 0 {
                            debug!("cache sweeper removed {} expired entries", removed);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn wrong_kind(key: &str, expected: &'static str) -> CacheError {
        CacheError::WrongKind { key: key.to_string(), expected }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        match self.slots.get(key) {
            Some(slot) if !slot.expired(Instant::now()) => match &slot.kind {
                Kind::Plain(v) => Ok(Some(v.clone())),
                Kind::Counter(n) => Ok(Some(Value::from(*n))),
                _ => Err(Self::wrong_kind(key, "plain")),
            },
            _ => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.slots.insert(
            key.to_string(),
            Slot {
                kind: Kind::Plain(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.slots.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .slots
            .get(key)
            .is_some_and(|slot| !slot.expired(Instant::now())))
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::live(Kind::Counter(0)));
        if slot.expired(Instant::now()) {
            *slot = Slot::live(Kind::Counter(0));
        }
        match &mut slot.kind {
            Kind::Counter(n) => {
                *n += delta;
                Ok(*n)
            }
            _ => Err(Self::wrong_kind(key, "counter")),
        }
    }

    async fn sadd(&self, key: &str, member: Value) -> Result<(), CacheError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::live(Kind::Set(Vec::new())));
        if slot.expired(Instant::now()) {
            *slot = Slot::live(Kind::Set(Vec::new()));
        }
        match &mut slot.kind {
            Kind::Set(members) => {
                if !members.contains(&member) {
                    members.push(member);
                }
                Ok(())
            }
            _ => Err(Self::wrong_kind(key, "set")),
        }
    }

    async fn srem(&self, key: &str, member: &Value) -> Result<(), CacheError> {
        if let Some(mut slot) = self.slots.get_mut(key) {
            if let Kind::Set(members) = &mut slot.kind {
                members.retain(|m| m != member);
                return Ok(());
            }
            return Err(Self::wrong_kind(key, "set"));
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<Value>, CacheError> {
        match self.slots.get(key) {
            Some(slot) if !slot.expired(Instant::now()) => match &slot.kind {
                Kind::Set(members) => Ok(members.clone()),
                _ => Err(Self::wrong_kind(key, "set")),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn lpush(&self, key: &str, value: Value) -> Result<(), CacheError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::live(Kind::List(VecDeque::new())));
        if slot.expired(Instant::now()) {
            *slot = Slot::live(Kind::List(VecDeque::new()));
        }
        match &mut slot.kind {
            Kind::List(items) => {
                items.push_front(value);
                Ok(())
            }
            _ => Err(Self::wrong_kind(key, "list")),
        }
    }

    async fn lpop(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if let Some(mut slot) = self.slots.get_mut(key) {
            if slot.expired(Instant::now()) {
                return Ok(None);
            }
            return match &mut slot.kind {
                Kind::List(items) => Ok(items.pop_front()),
                _ => Err(Self::wrong_kind(key, "list")),
            };
        }
        Ok(None)
    }

    async fn lrange(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>, CacheError> {
        match self.slots.get(key) {
            Some(slot) if !slot.expired(Instant::now()) => match &slot.kind {
                Kind::List(items) => {
                    let len = items.len() as i64;
                    let from = normalize_index(start, len).min(len);
                    let to = (normalize_index(end, len) + 1).min(len);
                    if from >= to {
                        return Ok(Vec::new());
                    }
                    Ok(items
                        .iter()
                        .skip(from as usize)
                        .take((to - from) as usize)
                        .cloned()
                        .collect())
                }
                _ => Err(Self::wrong_kind(key, "list")),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<(), CacheError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::live(Kind::Hash(FxHashMap::default())));
        if slot.expired(Instant::now()) {
            *slot = Slot::live(Kind::Hash(FxHashMap::default()));
        }
        match &mut slot.kind {
            Kind::Hash(fields) => {
                fields.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(Self::wrong_kind(key, "hash")),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>, CacheError> {
        match self.slots.get(key) {
            Some(slot) if !slot.expired(Instant::now()) => match &slot.kind {
                Kind::Hash(fields) => Ok(fields.get(field).cloned()),
                _ => Err(Self::wrong_kind(key, "hash")),
            },
            _ => Ok(None),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), CacheError> {
        if let Some(mut slot) = self.slots.get_mut(key) {
            if let Kind::Hash(fields) = &mut slot.kind {
                fields.remove(field);
                return Ok(());
            }
            return Err(Self::wrong_kind(key, "hash"));
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>, CacheError> {
        match self.slots.get(key) {
            Some(slot) if !slot.expired(Instant::now()) => match &slot.kind {
                Kind::Hash(fields) => {
                    let mut out: Vec<(String, Value)> = fields
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    out.sort_by(|a, b| a.0.cmp(&b.0));
                    Ok(out)
                }
                _ => Err(Self::wrong_kind(key, "hash")),
            },
            _ => Ok(Vec::new()),
        }
    }
}

/// Map a possibly-negative list index to a head offset.
fn normalize_index(i: i64, len: i64) -> i64 {
    if i < 0 { (len + i).max(0) } else { i }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_roundtrip_within_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", json!({"a": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert!(cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_after_expiry_is_miss() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", json!(1), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_slots() {
        let cache = MemoryCache::new();
        let (tx, rx) = watch::channel(false);
        cache.spawn_sweeper(rx);
        cache
            .set_with_ttl("k", json!(1), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(cache.slots.get("k").is_none());
        let _ = tx.send(true);
    }

    #[tokio::test]
    async fn test_incr_is_linearizable_under_contention() {
        let cache = MemoryCache::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    c.incr("hits", 1).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.incr("hits", 0).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn test_set_members_dedup() {
        let cache = MemoryCache::new();
        cache.sadd("s", json!("a")).await.unwrap();
        cache.sadd("s", json!("a")).await.unwrap();
        cache.sadd("s", json!("b")).await.unwrap();
        assert_eq!(cache.smembers("s").await.unwrap().len(), 2);
        cache.srem("s", &json!("a")).await.unwrap();
        assert_eq!(cache.smembers("s").await.unwrap(), vec![json!("b")]);
    }

    #[tokio::test]
    async fn test_list_push_pop_range() {
        let cache = MemoryCache::new();
        cache.lpush("l", json!(1)).await.unwrap();
        cache.lpush("l", json!(2)).await.unwrap();
        cache.lpush("l", json!(3)).await.unwrap();
        // head is most recently pushed
        assert_eq!(
            cache.lrange("l", 0, -1).await.unwrap(),
            vec![json!(3), json!(2), json!(1)]
        );
        assert_eq!(cache.lrange("l", 1, 1).await.unwrap(), vec![json!(2)]);
        assert_eq!(cache.lpop("l").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let cache = MemoryCache::new();
        cache.hset("h", "f1", json!("v1")).await.unwrap();
        cache.hset("h", "f2", json!("v2")).await.unwrap();
        assert_eq!(cache.hget("h", "f1").await.unwrap(), Some(json!("v1")));
        assert_eq!(cache.hgetall("h").await.unwrap().len(), 2);
        cache.hdel("h", "f1").await.unwrap();
        assert_eq!(cache.hget("h", "f1").await.unwrap(), None);
        assert_eq!(cache.hgetall("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_an_error() {
        let cache = MemoryCache::new();
        cache.hset("h", "f", json!(1)).await.unwrap();
        assert!(matches!(
            cache.incr("h", 1).await,
            Err(CacheError::WrongKind { .. })
        ));
        assert!(matches!(
            cache.smembers("h").await,
            Err(CacheError::WrongKind { .. })
        ));
    }
}
