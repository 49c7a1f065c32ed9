//! In-process [`Cache`] for tests and single-node deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use super::Cache;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Operations between full sweeps of expired entries.
const SWEEP_EVERY: u64 = 1024;

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    ops: u64,
}

/// `HashMap` behind a `Mutex`. An expired entry is dropped when its key is
/// touched; a full sweep runs every [`SWEEP_EVERY`] operations.
pub struct InMemoryCache {
    state: Mutex<State>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn with_key<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        guard.ops += 1;
        if guard.ops % SWEEP_EVERY == 0 {
            guard.entries.retain(|_, entry| entry.live(now));
        } else if guard.entries.get(key).is_some_and(|entry| !entry.live(now)) {
            guard.entries.remove(key);
        }
        f(&mut guard.entries, now)
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_key(key, |map, _| map.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_key(key, |map, now| {
            map.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| now + t),
                },
            );
        });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.with_key(key, |map, now| {
            if map.contains_key(key) {
                return false;
            }
            map.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| now + t),
                },
            );
            true
        }))
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        self.with_key(key, |map, now| match map.get_mut(key) {
            Some(entry) => {
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("value at '{}' is not an integer", key))?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
                Ok(1)
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_key(key, |map, _| {
            map.remove(key);
        });
        Ok(())
    }

    async fn ttl_ms(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.with_key(key, |map, now| {
            map.get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{get_json, set_json};

    #[tokio::test]
    async fn test_set_nx_only_writes_once() {
        let cache = InMemoryCache::new();
        assert!(cache.set_nx("k", "a", None).await.unwrap());
        assert!(!cache.set_nx("k", "b", None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_incr_keeps_first_ttl() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.incr("n", Some(Duration::from_secs(60))).await.unwrap(), 1);
        assert_eq!(cache.incr("n", Some(Duration::from_secs(1))).await.unwrap(), 2);
        let ttl = cache.ttl_ms("n").await.unwrap().unwrap();
        assert!(ttl > 1_000, "ttl was reset to {}", ttl);
    }

    #[tokio::test]
    async fn test_expired_entries_vanish() {
        let cache = InMemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.ttl_ms("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept_periodically() {
        let cache = InMemoryCache::new();
        for i in 0..10 {
            cache
                .set(&format!("gone-{}", i), "v", Some(Duration::from_millis(5)))
                .await
                .unwrap();
        }
        cache.set("kept", "v", None).await.unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // touching one key only drops that key
        assert!(cache.get("gone-0").await.unwrap().is_none());
        assert_eq!(cache.stored(), 10);

        for _ in 0..SWEEP_EVERY {
            cache.get("kept").await.unwrap();
        }
        assert_eq!(cache.stored(), 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = InMemoryCache::new();
        set_json(&cache, "j", &vec![1, 2, 3], None).await.unwrap();
        let back: Option<Vec<i32>> = get_json(&cache, "j").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
