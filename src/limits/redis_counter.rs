use async_trait::async_trait;

use super::RateLimitError;
use super::tiered::RemoteCounter;

/// Counter backed by a Redis server speaking the native protocol.
#[derive(Clone, Debug)]
pub struct RedisCounter {
    client: redis::Client,
}

impl RedisCounter {
    pub fn new(url: impl AsRef<str>) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl RemoteCounter for RedisCounter {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<u64, RateLimitError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|err| RateLimitError::backend(format!("redis error: {err}")))?;

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(window_secs)
            .arg("NX")
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|err| RateLimitError::backend(format!("redis error: {err}")))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> Option<String> {
        ["MERSE_REDIS_URL", "REDIS_URL"].into_iter().find_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
        })
    }

    #[tokio::test]
    async fn increments_and_sets_window_expiry() {
        let Some(url) = redis_url() else {
            return;
        };
        let counter = RedisCounter::new(url).expect("client");
        let key = format!("merse_test:{}", crate::utils::now_epoch_millis());

        assert_eq!(counter.increment(&key, 60).await.expect("incr"), 1);
        assert_eq!(counter.increment(&key, 60).await.expect("incr"), 2);
    }

    #[tokio::test]
    async fn unreachable_server_is_backend_unavailable() {
        let counter = RedisCounter::new("redis://127.0.0.1:1/").expect("client");
        let err = counter.increment("k", 60).await.expect_err("unreachable");
        assert!(matches!(err, RateLimitError::CounterBackendUnavailable { .. }));
    }
}
