/// Field Booking Backend Application
///
/// Entry point of the field booking service. It wires the PostgreSQL store, the
/// booking cache, the payment gateway client and the background task pool into the
/// booking and payment services, then runs the HTTP server and the expiration sweeper
/// until a shutdown signal arrives.
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use app_config::AppConfig;
use cache::{Cache, CacheKeys, MemoryCache, RedisCache};
use model::{Clock, SystemClock};
use repository::{BookingStore, PgBookingStore};
use server::{AppState, Server};
use service::{
    BookingCache, BookingServiceImpl, BookingSettings, ExpirationSweeper, HttpInvoiceGateway,
    LogNotifier, PaymentServiceImpl, PaymentSettings, ServiceMetrics, TaskPool,
};

const MIGRATIONS_DIR: &str = "migrations";

/// Initialize the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_logger(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_cache(cfg: &AppConfig) -> Result<Arc<dyn Cache>> {
    match cfg.cache_backend.as_str() {
        "redis" => {
            let cache = RedisCache::connect(&cfg.redis_url)
                .await
                .context("Failed to connect to Redis")?;
            info!("Using Redis cache");
            Ok(Arc::new(cache))
        }
        "memory" => {
            info!("Using in-process cache");
            Ok(Arc::new(MemoryCache::new()))
        }
        other => bail!("Unknown cache backend '{other}', expected 'redis' or 'memory'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_logger(&config.log_level);
    info!(app = %config.app_name, "Field booking backend starting...");

    if config.payment_callback_token.is_empty() {
        warn!("payment_callback_token is empty, every payment callback will be rejected");
    }

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown_signal.notify_waiters();
            }
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    });

    let pool = db::init_db_pool(&config, MIGRATIONS_DIR)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");
    let store: Arc<dyn BookingStore> = Arc::new(PgBookingStore::new(pool));

    let cache = build_cache(&config).await?;
    let metrics = Arc::new(ServiceMetrics::new().context("Failed to register metrics")?);
    let tasks = Arc::new(TaskPool::new(
        config.background_workers,
        config.background_queue_size,
        metrics.clone(),
    ));
    let booking_cache = BookingCache::new(
        cache,
        CacheKeys::new(config.app_name.clone()),
        tasks.clone(),
        config.cache_ttl,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let gateway =
        Arc::new(HttpInvoiceGateway::new(&config).context("Failed to build payment client")?);
    let payments = Arc::new(PaymentServiceImpl::new(
        store.clone(),
        gateway,
        Arc::new(LogNotifier),
        booking_cache.clone(),
        tasks.clone(),
        metrics.clone(),
        clock.clone(),
        PaymentSettings::from_config(&config),
    ));
    let bookings = Arc::new(BookingServiceImpl::new(
        store.clone(),
        payments.clone(),
        booking_cache.clone(),
        metrics.clone(),
        clock.clone(),
        BookingSettings::from_config(&config)?,
    ));
    let sweeper = ExpirationSweeper::new(
        store,
        booking_cache,
        metrics.clone(),
        clock,
        config.sweep_interval,
    );

    let http_server = Server::new(
        config.http_port,
        AppState {
            bookings,
            payments,
            metrics,
        },
    )?;

    let mut running = JoinSet::new();

    let sweeper_shutdown = shutdown.clone();
    running.spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    });

    let server_shutdown = shutdown.clone();
    let stop_all = shutdown.clone();
    running.spawn(async move {
        if let Err(err) = http_server.start(server_shutdown).await {
            error!("HTTP server error: {:#}", err);
            // Take the sweeper down with the server.
            stop_all.notify_waiters();
        }
    });

    while let Some(res) = running.join_next().await {
        if let Err(err) = res {
            error!("Task error: {}", err);
        }
    }

    tasks.shutdown(config.shutdown_timeout).await;
    info!("Application stopped");
    Ok(())
}
