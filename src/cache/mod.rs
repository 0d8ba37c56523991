//! Cache store contract
//!
//! Typed TTL key-value store the engines depend on: plain values, counters,
//! sets, lists, and hashes. Values are self-describing JSON
//! (`serde_json::Value`), so any backend that speaks the same operations can
//! be dropped in (the in-memory [`memory::MemoryCache`] is the default).
//!
//! TTL semantics: precision is 1 second; an entry set with TTL `t` is
//! readable for at least `t − 1` s and gone no later than `t + 2` s.
//! Structure operations (set/list/hash) create non-expiring entries.

pub mod memory;

pub use memory::MemoryCache;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("wrong entry kind for key {key}: expected {expected}")]
    WrongKind { key: String, expected: &'static str },

    #[error("value is not representable: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// The key-value contract (C1). All operations are atomic per key;
/// a failed operation leaves no partial state visible.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Add `delta` to an integer counter, creating it at 0 first.
    /// Concurrent increments are linearizable.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    async fn sadd(&self, key: &str, member: Value) -> Result<(), CacheError>;
    async fn srem(&self, key: &str, member: &Value) -> Result<(), CacheError>;
    async fn smembers(&self, key: &str) -> Result<Vec<Value>, CacheError>;

    async fn lpush(&self, key: &str, value: Value) -> Result<(), CacheError>;
    async fn lpop(&self, key: &str) -> Result<Option<Value>, CacheError>;
    /// Inclusive range from the head; `end = -1` means "to the tail".
    async fn lrange(&self, key: &str, start: i64, end: i64) -> Result<Vec<Value>, CacheError>;

    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<(), CacheError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>, CacheError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), CacheError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>, CacheError>;
}

/// Typed convenience layer over the self-describing values.
#[async_trait]
pub trait CacheExt: CacheStore {
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.set_with_ttl(key, serde_json::to_value(value)?, ttl).await
    }

    async fn hset_json<T: Serialize + Sync>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.hset(key, field, serde_json::to_value(value)?).await
    }

    async fn hgetall_json<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Vec<(String, T)>, CacheError> {
        let mut out = Vec::new();
        for (field, v) in self.hgetall(key).await? {
            out.push((field, serde_json::from_value(v)?));
        }
        Ok(out)
    }
}

impl<T: CacheStore + ?Sized> CacheExt for T {}
