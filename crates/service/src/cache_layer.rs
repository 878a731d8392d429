//! Read-through caching of booking reads and invalidation after writes.
//!
//! Every booking list, count and availability key lives under one prefix so a single
//! `clear_by_prefix` drops all of them. Cache failures never fail a request.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cache::{Cache, CacheKeys, get_json, unique_key};
use chrono::NaiveDate;
use model::Pagination;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{ServiceError, TaskPool};

const BOOKING_KEY: &str = "booking";
const BOOKINGS_KEY: &str = "bookings";
const BOOKINGS_COUNT_KEY: &str = "bookings:count";

/// Cache access shared by the booking engine, the callback handler and the sweeper.
#[derive(Clone)]
pub struct BookingCache {
    cache: Arc<dyn Cache>,
    keys: CacheKeys,
    tasks: Arc<TaskPool>,
    ttl: Duration,
}

impl BookingCache {
    pub fn new(cache: Arc<dyn Cache>, keys: CacheKeys, tasks: Arc<TaskPool>, ttl: Duration) -> Self {
        Self {
            cache,
            keys,
            tasks,
            ttl,
        }
    }

    pub fn booking_key(&self, id: Uuid) -> String {
        self.keys.build(BOOKING_KEY, Some(&id.to_string()))
    }

    pub fn bookings_key(&self, user_id: Uuid, page: &Pagination) -> String {
        let (page_no, limit) = page.normalized();
        let mut args = BTreeMap::new();
        args.insert("user_id", user_id.to_string());
        args.insert("page", page_no.to_string());
        args.insert("limit", limit.to_string());
        args.insert("filter", page.filter.trim().to_string());
        self.keys.build(BOOKINGS_KEY, Some(&unique_key(&args)))
    }

    pub fn count_key(&self, user_id: Uuid, filter: &str) -> String {
        let mut args = BTreeMap::new();
        args.insert("user_id", user_id.to_string());
        args.insert("filter", filter.trim().to_string());
        self.keys.build(BOOKINGS_COUNT_KEY, Some(&unique_key(&args)))
    }

    pub fn slots_key(&self, field_id: Uuid, date: NaiveDate) -> String {
        let mut args = BTreeMap::new();
        args.insert("field_id", field_id.to_string());
        args.insert("date", date.to_string());
        self.keys.build(BOOKINGS_KEY, Some(&unique_key(&args)))
    }

    /// Serve `key` from the cache, or run `load` and populate the cache in the background.
    pub async fn read_through<T, F, Fut>(&self, key: String, load: F) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match get_json::<T>(self.cache.as_ref(), &key).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Cache read failed, loading from store"),
        }

        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                let cache = self.cache.clone();
                let ttl = self.ttl;
                self.tasks.submit("cache_save", async move {
                    cache
                        .save(&key, raw, ttl)
                        .await
                        .map_err(|e| format!("saving {key}: {e}"))
                });
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode value for cache"),
        }
        Ok(value)
    }

    /// Drop every booking list, count and availability entry, plus the single-booking
    /// entry of `booking_id` when given. Runs in the background.
    pub fn invalidate_bookings(&self, booking_id: Option<Uuid>) {
        self.invalidate(booking_id.into_iter().collect());
    }

    /// Same as [`Self::invalidate_bookings`] for several changed bookings at once.
    pub fn invalidate_many(&self, booking_ids: &[Uuid]) {
        self.invalidate(booking_ids.to_vec());
    }

    fn invalidate(&self, booking_ids: Vec<Uuid>) {
        let cache = self.cache.clone();
        let singles: Vec<String> = booking_ids.iter().map(|id| self.booking_key(*id)).collect();
        let prefix = self.keys.prefix(&format!("{BOOKINGS_KEY}:"));

        self.tasks.submit("cache_invalidate", async move {
            for key in &singles {
                cache
                    .delete(key)
                    .await
                    .map_err(|e| format!("deleting {key}: {e}"))?;
            }
            let removed = cache
                .clear_by_prefix(&prefix)
                .await
                .map_err(|e| format!("clearing {prefix}: {e}"))?;
            debug!(prefix = %prefix, removed, "Invalidated booking caches");
            Ok(())
        });
    }
}
