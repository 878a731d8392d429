//! Thread-safe in-memory cache with per-entry expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{Cache, CacheError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Cache kept in process memory. Expired entries are dropped lazily on read.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.read().await;
        map.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let map = self.inner.read().await;
            match map.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut map = self.inner.write().await;
        if map.get(key).is_some_and(|e| e.expires_at <= Instant::now()) {
            map.remove(key);
        }
        Ok(None)
    }

    async fn save(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut map = self.inner.write().await;
        map.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.inner.write().await;
        map.remove(key);
        Ok(())
    }

    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|key, _| !key.starts_with(prefix));
        Ok((before - map.len()) as u64)
    }
}
