//! Business logic layer for field bookings.
//!
//! This crate owns the booking engine ([`BookingService`]), the payment adapter and
//! gateway callback handler ([`PaymentService`]), the expiration sweeper, and the
//! post-commit machinery they share: the background [`TaskPool`], the booking cache
//! layer and the Prometheus [`ServiceMetrics`].
//!
//! # Features
//! - Overlap-safe booking creation inside one transaction with a deadline.
//! - Status changes through single conditional statements or one transaction.
//! - Cache-fronted reads with prefix invalidation after every write.
//! - Post-commit side effects detached from the caller and observable through metrics.

mod background;
mod booking;
mod cache_layer;
mod gateway;
mod metrics;
mod notify;
mod payment;
mod sweeper;

use std::time::Duration;

use anyhow::Context;
use app_config::AppConfig;
use chrono::TimeDelta;
use chrono_tz::Tz;
use repository::RepositoryError;
use thiserror::Error;

pub use background::TaskPool;
pub use booking::{BookingService, BookingServiceImpl};
pub use cache_layer::BookingCache;
pub use gateway::{GatewayError, GatewayInvoice, HttpInvoiceGateway, InvoiceGateway, InvoiceOrder};
pub use metrics::ServiceMetrics;
pub use notify::{LogNotifier, Notifier};
pub use payment::{PaymentAdapter, PaymentService, PaymentServiceImpl};
pub use sweeper::ExpirationSweeper;

/// The error type of every service operation.
///
/// Each variant carries a message safe to show to the caller, except
/// [`ServiceError::Internal`] whose detail is meant for logs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Malformed input or a booking time in the past.
    #[error("{0}")]
    BadRequest(String),
    /// The requested slot overlaps an active booking, or the state forbids the change.
    #[error("{0}")]
    Conflict(String),
    /// The actor's role does not allow the operation.
    #[error("{0}")]
    Forbidden(String),
    /// Missing caller identity or bad callback token.
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    /// Storage, gateway or runtime failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "BAD_REQUEST",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code for the delivery layer.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::Unauthorized(_) => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::Internal(_) => 500,
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServiceError::NotFound("resource not found".into()),
            RepositoryError::Overlap => ServiceError::Conflict(OVERLAP_MESSAGE.into()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

pub(crate) const OVERLAP_MESSAGE: &str = "there are already bookings for this field at this time";

/// Booking engine settings taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct BookingSettings {
    /// Timezone booking dates and start times are interpreted in.
    pub timezone: Tz,
    /// How long a pending booking waits for payment.
    pub grace_period: TimeDelta,
    /// Deadline of every transactional operation.
    pub tx_timeout: Duration,
}

impl BookingSettings {
    /// # Errors
    /// Returns an error if the timezone is unknown or the grace period is out of range.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            timezone: cfg.timezone()?,
            grace_period: TimeDelta::from_std(cfg.booking_grace_period)
                .context("booking_grace_period is out of range")?,
            tx_timeout: cfg.tx_timeout,
        })
    }
}

/// Payment adapter and callback settings taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    /// Shared secret of gateway callbacks. Empty rejects every callback.
    pub callback_token: String,
    /// Smallest amount an invoice may be issued for.
    pub min_amount: i64,
    pub tx_timeout: Duration,
}

impl PaymentSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            callback_token: cfg.payment_callback_token.clone(),
            min_amount: cfg.payment_min_amount,
            tx_timeout: cfg.tx_timeout,
        }
    }
}
