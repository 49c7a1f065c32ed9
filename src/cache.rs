//! Redis-backed [`Cache`] and backend selection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::FromRedisValue;
use tokio::sync::Mutex;

use shelf_core::cache::memory::InMemoryCache;
use shelf_core::cache::Cache;

use crate::config::{CacheBackend, CacheConfig};

/// One multiplexed connection, reopened once when a command fails.
pub struct RedisCache {
    client: redis::Client,
    key_prefix: String,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisCache {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url for cache: {}", url))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.trim_end_matches(':').to_string(),
            connection: Mutex::new(None),
        })
    }

    fn key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    async fn run<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..2 {
            let mut guard = self.connection.lock().await;
            if guard.is_none() {
                *guard = Some(
                    self.client
                        .get_multiplexed_async_connection()
                        .await
                        .context("failed to open redis connection for cache")?,
                );
            }
            let conn = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("redis cache connection unavailable"))?;
            let result: redis::RedisResult<T> = build().query_async(conn).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(operation, attempt = attempt + 1, error = %err, "redis command failed; reconnecting");
                    *guard = None;
                    last_err = Some(anyhow::anyhow!(err).context("redis command failed"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("redis command failed")))
    }
}

fn ttl_ms(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|d| d.as_millis().max(1) as u64)
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.key(key);
        self.run("get", || {
            let mut cmd = redis::cmd("GET");
            cmd.arg(&key);
            cmd
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = self.key(key);
        let px = ttl_ms(ttl);
        self.run::<(), _>("set", || {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(value);
            if let Some(px) = px {
                cmd.arg("PX").arg(px);
            }
            cmd
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let key = self.key(key);
        let px = ttl_ms(ttl);
        let reply: Option<String> = self
            .run("set_nx", || {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key).arg(value).arg("NX");
                if let Some(px) = px {
                    cmd.arg("PX").arg(px);
                }
                cmd
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let key = self.key(key);
        let value: i64 = self
            .run("incr", || {
                let mut cmd = redis::cmd("INCR");
                cmd.arg(&key);
                cmd
            })
            .await?;
        if value == 1 {
            if let Some(px) = ttl_ms(ttl) {
                self.run::<i64, _>("pexpire", || {
                    let mut cmd = redis::cmd("PEXPIRE");
                    cmd.arg(&key).arg(px);
                    cmd
                })
                .await?;
            }
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.key(key);
        self.run::<i64, _>("del", || {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(&key);
            cmd
        })
        .await?;
        Ok(())
    }

    async fn ttl_ms(&self, key: &str) -> Result<Option<u64>> {
        let key = self.key(key);
        let remaining: i64 = self
            .run("pttl", || {
                let mut cmd = redis::cmd("PTTL");
                cmd.arg(&key);
                cmd
            })
            .await?;
        // -2: missing, -1: no expiry
        Ok((remaining >= 0).then_some(remaining as u64))
    }
}

/// Build the configured cache backend.
pub fn build_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(InMemoryCache::new())),
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("cache.redis_url is required for the redis backend")?;
            tracing::info!(key_prefix = %config.key_prefix, "using redis cache");
            Ok(Arc::new(RedisCache::new(url, &config.key_prefix)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let cache = RedisCache::new("redis://127.0.0.1:6379", "shelf:").unwrap();
        assert_eq!(cache.key("llm:stats"), "shelf:llm:stats");
    }

    #[test]
    fn test_memory_backend_by_default() {
        assert!(build_cache(&CacheConfig::default()).is_ok());
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let config = CacheConfig {
            backend: CacheBackend::Redis,
            redis_url: None,
            key_prefix: "shelf".into(),
        };
        assert!(build_cache(&config).is_err());
    }
}
