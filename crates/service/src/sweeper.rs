use std::sync::Arc;
use std::time::Duration;

use model::Clock;
use repository::BookingStore;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::{BookingCache, ServiceError, ServiceMetrics};

/// Periodically moves pending bookings past their payment deadline to EXPIRED,
/// releasing their slots.
pub struct ExpirationSweeper {
    store: Arc<dyn BookingStore>,
    cache: BookingCache,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(
        store: Arc<dyn BookingStore>,
        cache: BookingCache,
        metrics: Arc<ServiceMetrics>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            clock,
            interval,
        }
    }

    /// One sweep. Safe to run concurrently with itself and with callbacks: only rows
    /// still PENDING at update time change.
    pub async fn expire_old_bookings(&self) -> Result<u64, ServiceError> {
        let expired_ids = self.store.expire_old_bookings(self.clock.now()).await?;
        let expired = expired_ids.len() as u64;
        if expired > 0 {
            info!(expired, "Expired unpaid bookings");
            self.metrics.record_expired(expired);
            self.cache.invalidate_many(&expired_ids);
        } else {
            debug!("No bookings to expire");
        }
        Ok(expired)
    }

    /// Sweep every interval until `shutdown` is notified. A failed sweep is logged and
    /// retried on the next tick.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        info!(interval = ?self.interval, "Expiration sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.expire_old_bookings().await {
                        error!(error = %e, "Expiration sweep failed");
                    }
                }
                _ = &mut stop => {
                    info!("Expiration sweeper received shutdown signal.");
                    break;
                }
            }
        }
    }
}
