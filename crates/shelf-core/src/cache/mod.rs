//! Key/value cache abstraction.
//!
//! The [`Cache`] trait covers the handful of primitives every guardrail in
//! Shelf is built on: plain get/set with TTL, set-if-absent, atomic
//! increment with TTL on first write, and remaining-TTL lookup. Two
//! backends exist: [`memory::InMemoryCache`] here and a Redis-backed cache
//! in the service crate.
//!
//! Values are strings; [`get_json`] / [`set_json`] wrap them for typed
//! payloads.

pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Store `value` only when `key` is absent. Returns `true` when written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Atomically increment a counter. The TTL is applied only when the
    /// increment created the key.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remaining TTL in milliseconds; `None` when the key is missing or has
    /// no expiry.
    async fn ttl_ms(&self, key: &str) -> Result<Option<u64>>;
}

pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => Ok(serde_json::from_str(&raw).ok()),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, &raw, ttl).await
}
