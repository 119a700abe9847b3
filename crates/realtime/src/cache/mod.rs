// Shared key/value + pub/sub cache consumed by presence and the offline log.
//
// Backends are swappable behind `SharedCache`; the in-process backend is the
// default and the Redis backend is available behind the `redis` feature.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_cache;

use std::{future::Future, pin::Pin, time::Duration};

use thiserror::Error;

pub use memory::{CacheMessage, InMemoryCache};
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode cache value: {0}")]
    Encode(#[from] serde_json::Error),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

pub trait SharedCache: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()>;

    fn del<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> CacheFuture<'a, ()>;

    /// Pushes `value` to the head of the list at `key`, keeps at most
    /// `max_len` entries, and refreshes the list TTL.
    fn append_and_trim<'a>(
        &'a self,
        key: &'a str,
        value: String,
        max_len: usize,
        ttl: Duration,
    ) -> CacheFuture<'a, ()>;

    /// Drops keys whose TTL has lapsed and returns how many were removed.
    /// Backends that expire keys on their own keep the default.
    fn purge_expired(&self) -> CacheFuture<'_, usize> {
        Box::pin(async { Ok(0) })
    }
}

pub fn presence_key(workspace_id: &str, user_id: &str) -> String {
    format!("presence:{workspace_id}:{user_id}")
}

pub fn presence_channel(workspace_id: &str) -> String {
    format!("presence:{workspace_id}")
}

pub fn offline_events_key(workspace_id: &str) -> String {
    format!("offline_events:{workspace_id}")
}
