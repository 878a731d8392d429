//! Redis backend on a multiplexed `ConnectionManager`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::{Cache, CacheError};

const SCAN_BATCH: usize = 200;

/// Redis-backed cache. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns an error if the URL is malformed or the server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        info!("Connected to Redis");
        Ok(Self { conn_manager })
    }
}

/// Escape glob metacharacters so a key prefix matches literally in `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn save(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, seconds).await?;
        debug!(key, seconds, "Saved cache entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn_manager.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix, removed, "Cleared cache prefix");
        Ok(removed)
    }
}
