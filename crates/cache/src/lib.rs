//! Key/value cache fronting booking reads, with a Redis backend for deployments and an
//! in-memory backend for local runs and tests.
//!
//! The cache is a best-effort projection of the database: entries expire after a TTL and
//! writers invalidate whole key families by prefix. Nothing reads it for conflict checks.

mod keys;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub use keys::{CacheKeys, unique_key};
pub use memory::MemoryCache;
pub use redis_store::RedisCache;

/// # CacheError
///
/// Errors raised by cache backends and the typed helpers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// # Cache
///
/// String-valued cache with per-entry TTL and prefix invalidation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Value stored under `key`, or `None` on a miss or an expired entry.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key` for `ttl`.
    async fn save(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`. Returns how many keys were removed.
    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn Cache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => {
            debug!(key, "Cache miss");
            Ok(None)
        }
    }
}

/// Encode `value` as JSON and store it.
pub async fn save_json<T: Serialize + ?Sized>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.save(key, raw, ttl).await
}
