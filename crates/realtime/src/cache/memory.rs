use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};

use super::{CacheFuture, SharedCache};

const NOTIFICATION_CAPACITY: usize = 1_024;

/// A message delivered to in-process pub/sub subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug)]
enum StoredValue {
    Scalar(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Single-process stand-in for the shared cache. Expiry is evaluated lazily
/// on access, the same observable behavior as a TTL'd Redis key.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    notifications: broadcast::Sender<CacheMessage>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { entries: Mutex::new(HashMap::new()), notifications }
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every channel published through this cache.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheMessage> {
        self.notifications.subscribe()
    }

    /// Returns the live list at `key`, newest first.
    pub async fn list_range(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let guard = self.entries.lock().await;
        match guard.get(key) {
            Some(Entry { value: StoredValue::List(items), expires_at }) if now < *expires_at => {
                items.iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Remaining lifetime of a live key.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let guard = self.entries.lock().await;
        guard
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at.saturating_duration_since(now))
    }

    /// Number of stored keys, expired ones included until purged.
    pub async fn key_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl SharedCache for InMemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut guard = self.entries.lock().await;
            let live = guard.get(key).map(|entry| entry.is_live(now));
            match live {
                Some(false) => {
                    guard.remove(key);
                    Ok(None)
                }
                Some(true) => Ok(match guard.get(key).map(|entry| &entry.value) {
                    Some(StoredValue::Scalar(value)) => Some(value.clone()),
                    _ => None,
                }),
                None => Ok(None),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = Instant::now() + ttl;
            self.entries
                .lock()
                .await
                .insert(key.to_string(), Entry { value: StoredValue::Scalar(value), expires_at });
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            // No subscribers is not an error for pub/sub.
            let _ = self.notifications.send(CacheMessage { channel: channel.to_string(), payload });
            Ok(())
        })
    }

    fn append_and_trim<'a>(
        &'a self,
        key: &'a str,
        value: String,
        max_len: usize,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let mut guard = self.entries.lock().await;
            let entry = guard
                .entry(key.to_string())
                .or_insert_with(|| Entry { value: StoredValue::List(VecDeque::new()), expires_at: now });
            if !entry.is_live(now) || !matches!(entry.value, StoredValue::List(_)) {
                entry.value = StoredValue::List(VecDeque::new());
            }
            if let StoredValue::List(items) = &mut entry.value {
                items.push_front(value);
                items.truncate(max_len);
            }
            entry.expires_at = now + ttl;
            Ok(())
        })
    }

    fn purge_expired(&self) -> CacheFuture<'_, usize> {
        Box::pin(async move {
            let now = Instant::now();
            let mut guard = self.entries.lock().await;
            let before = guard.len();
            guard.retain(|_, entry| entry.is_live(now));
            Ok(before - guard.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_delete() {
        let cache = InMemoryCache::new();
        cache.set("k", "v".to_string(), Duration::from_secs(10)).await.expect("set should work");
        assert_eq!(cache.get("k").await.expect("get should work").as_deref(), Some("v"));

        cache.del("k").await.expect("del should work");
        assert_eq!(cache.get("k").await.expect("get should work"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", "v".to_string(), Duration::from_secs(5)).await.expect("set should work");

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("k").await.expect("get should work").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.expect("get should work").is_none());
    }

    #[tokio::test]
    async fn append_and_trim_keeps_newest_entries_first() {
        let cache = InMemoryCache::new();
        for index in 0..5 {
            cache
                .append_and_trim("log", index.to_string(), 3, Duration::from_secs(60))
                .await
                .expect("append should work");
        }

        assert_eq!(cache.list_range("log").await, vec!["4", "3", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn append_and_trim_refreshes_ttl_and_restarts_expired_lists() {
        let cache = InMemoryCache::new();
        cache
            .append_and_trim("log", "a".to_string(), 10, Duration::from_secs(10))
            .await
            .expect("append should work");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.list_range("log").await.is_empty());

        cache
            .append_and_trim("log", "b".to_string(), 10, Duration::from_secs(10))
            .await
            .expect("append should work");
        assert_eq!(cache.list_range("log").await, vec!["b"]);
        assert_eq!(cache.ttl("log").await, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let cache = InMemoryCache::new();
        let mut receiver = cache.subscribe();

        cache.publish("presence:w1", "{}".to_string()).await.expect("publish should work");

        let message = receiver.recv().await.expect("message should arrive");
        assert_eq!(message.channel, "presence:w1");
        assert_eq!(message.payload, "{}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let cache = InMemoryCache::new();
        assert!(cache.publish("presence:w1", "{}".to_string()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_keys() {
        let cache = InMemoryCache::new();
        cache.set("short", "v".to_string(), Duration::from_secs(1)).await.expect("set should work");
        cache.set("long", "v".to_string(), Duration::from_secs(100)).await.expect("set should work");
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired().await.expect("purge should work"), 1);
        assert_eq!(cache.key_count().await, 1);
        assert!(cache.get("long").await.expect("get should work").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_expired_lists_that_were_never_read() {
        let cache = InMemoryCache::new();
        cache
            .append_and_trim("offline_events:w1", "e".to_string(), 10, Duration::from_secs(10))
            .await
            .expect("append should work");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.key_count().await, 1);

        assert_eq!(cache.purge_expired().await.expect("purge should work"), 1);
        assert_eq!(cache.key_count().await, 0);
    }
}
