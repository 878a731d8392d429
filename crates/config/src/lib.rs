use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the booking service.
///
/// The configuration is loaded from environment variables (optionally via a `.env` file)
/// or uses default values if the variable is not set. It is built once at startup and
/// handed to each component constructor; nothing reads it through global state.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Application ---
    /// Application name, used as the root of every cache key.
    pub app_name: String,
    /// IANA timezone in which booking dates and start times are interpreted.
    pub app_timezone: String,
    /// Log filter directive (e.g. "info", "service=debug,info").
    pub log_level: String,

    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Maximum number of pooled connections.
    pub db_pool_max: usize,

    // --- Cache settings ---
    /// Cache backend: "redis" or "memory".
    pub cache_backend: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Time-to-live of cached read results.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,

    // --- Booking lifecycle ---
    /// How long a pending booking waits for payment before the sweeper expires it.
    #[serde(deserialize_with = "deserialize_duration")]
    pub booking_grace_period: Duration,
    /// Interval between expiration sweeps.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
    /// Deadline applied to every transactional operation.
    #[serde(deserialize_with = "deserialize_duration")]
    pub tx_timeout: Duration,

    // --- Background work ---
    /// Number of workers draining the post-commit task queue.
    pub background_workers: usize,
    /// Capacity of the post-commit task queue; submissions beyond it are dropped.
    pub background_queue_size: usize,

    // --- Payment gateway ---
    /// Base URL of the invoice API.
    pub payment_api_url: String,
    /// Secret API key sent as the basic-auth user name.
    pub payment_api_key: String,
    /// Redirect target after a successful payment.
    pub payment_success_url: String,
    /// Redirect target after a failed payment.
    pub payment_failure_url: String,
    /// Shared secret expected in the `x-callback-token` header of gateway callbacks.
    pub payment_callback_token: String,
    /// Smallest invoice amount the gateway accepts.
    pub payment_min_amount: i64,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

/// Custom deserializer for durations.
/// Accepts human-readable formats like "5s", "1m", etc.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        let settings = Self::defaults()?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Builds configuration from defaults plus explicit overrides, ignoring the environment.
    ///
    /// # Errors
    /// Returns an error if an override has the wrong shape for its field.
    pub fn load_with(overrides: &[(&str, &str)]) -> Result<Self> {
        let mut builder = Self::defaults()?;
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        builder
            .build()?
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Parses `app_timezone` into a timezone.
    ///
    /// # Errors
    /// Returns an error if the name is not a known IANA timezone.
    pub fn timezone(&self) -> Result<Tz> {
        self.app_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("Invalid app_timezone '{}': {e}", self.app_timezone))
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        // Defaults target a local run; Docker Compose overrides hosts through the environment.
        let builder = config::Config::builder()
            // Application
            .set_default("app_name", "field-booking")?
            .set_default("app_timezone", "Asia/Jakarta")?
            .set_default("log_level", "info")?
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "booking_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "booking_db")?
            .set_default("db_pool_max", 16)?
            // Cache
            .set_default("cache_backend", "redis")?
            .set_default("redis_url", "redis://localhost:6379")?
            .set_default("cache_ttl", "5m")?
            // Booking lifecycle
            .set_default("booking_grace_period", "30m")?
            .set_default("sweep_interval", "5m")?
            .set_default("tx_timeout", "5s")?
            // Background work
            .set_default("background_workers", 4)?
            .set_default("background_queue_size", 1024)?
            // Payment gateway
            .set_default("payment_api_url", "https://api.xendit.co")?
            .set_default("payment_api_key", "")?
            .set_default("payment_success_url", "http://localhost:3000/payments/success")?
            .set_default("payment_failure_url", "http://localhost:3000/payments/failure")?
            .set_default("payment_callback_token", "")?
            .set_default("payment_min_amount", 10000)?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?;

        Ok(builder)
    }
}
