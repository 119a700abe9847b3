use std::time::Duration;

use redis::aio::MultiplexedConnection;

use super::{CacheError, CacheFuture, SharedCache};

/// Shared cache backed by Redis, used when several realtime processes share
/// presence and offline logs.
#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl SharedCache for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.connection.clone();
            let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.connection.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_seconds(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.connection.clone();
            let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.connection.clone();
            let _: () = redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut conn).await?;
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
            let mut conn = self.connection.clone();
            let last_index = max_len.saturating_sub(1) as i64;
            let _: () = redis::pipe()
                .atomic()
                .cmd("LPUSH")
                .arg(key)
                .arg(value)
                .ignore()
                .cmd("LTRIM")
                .arg(key)
                .arg(0)
                .arg(last_index)
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_seconds(ttl))
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }
}
