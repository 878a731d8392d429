//! # Data Repository Layer
//!
//! This module provides the storage interface for bookings and payments, with a
//! PostgreSQL implementation and an in-process implementation.
//!
//! Reads and single-statement writes go through [`BookingStore`]. Multi-step work that
//! must be atomic (booking creation, payment callbacks) opens a [`BookingTx`] with
//! [`BookingStore::begin`]; the transaction commits only through [`BookingTx::commit`]
//! and rolls back when dropped.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use model::{
    Booking, BookingStatus, CancelBooking, CanceledBy, NewBooking, NewPayment, Payment,
    PaymentStatusUpdate, TimeSlot,
};
use thiserror::Error;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

pub use memory::{MemoryBookingStore, MemoryBookingTx};
pub use postgres::{PgBookingStore, PgBookingTx};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[source] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// The row would overlap an active booking of the same field and date.
    #[error("Slot overlaps an active booking")]
    Overlap,
    /// A unique key is already taken.
    #[error("Duplicate key: {0}")]
    Duplicate(String),
    /// The transaction was already finished.
    #[error("Transaction is closed")]
    Closed,
}

impl From<tokio_postgres::Error> for RepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.code() {
            Some(code) if *code == SqlState::EXCLUSION_VIOLATION => RepositoryError::Overlap,
            Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
                RepositoryError::Duplicate(err.to_string())
            }
            _ => RepositoryError::Db(err),
        }
    }
}

/// # BookingStore
///
/// Storage interface for bookings and their payments.
///
/// Every write here is a single conditional statement, so it is atomic on its own and
/// cannot undo a more recent status change.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn BookingTx>, RepositoryError>;

    /// Get a booking by id, ignoring soft-deleted rows.
    async fn get_booking_by_id(&self, id: Uuid) -> Result<Booking, RepositoryError>;

    /// Page through a user's bookings, newest date first.
    async fn get_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, RepositoryError>;

    async fn count_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
    ) -> Result<i64, RepositoryError>;

    /// Intervals held by active bookings of a field on a date, ordered by start time.
    async fn get_booked_slots(
        &self,
        field_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, RepositoryError>;

    /// Cancel a booking if it is still in a status the cancelling party may cancel from.
    /// Returns the number of rows changed (0 or 1).
    async fn cancel_booking(&self, cancel: &CancelBooking) -> Result<u64, RepositoryError>;

    /// Cancel a booking whose settlement never completed (PENDING, or PAID by cash),
    /// releasing its slot. Used to compensate a failed payment step after creation.
    async fn cancel_unsettled(
        &self,
        id: Uuid,
        canceled_by: CanceledBy,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError>;

    /// Move every pending booking whose `expires_at` is before `now` to EXPIRED.
    /// Returns the ids of the rows changed.
    async fn expire_old_bookings(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError>;

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, RepositoryError>;

    /// All payment attempts of a booking, newest first.
    async fn get_payments_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Payment>, RepositoryError>;
}

/// # BookingTx
///
/// One open transaction. Dropping it without calling [`BookingTx::commit`] rolls back.
#[async_trait]
pub trait BookingTx: Send {
    /// Serialize with every other transaction touching the same field and date until
    /// this transaction ends.
    async fn lock_slot(&mut self, field_id: Uuid, date: NaiveDate) -> Result<(), RepositoryError>;

    /// Number of active bookings on `(field_id, date)` overlapping `[start, end)`.
    async fn count_overlaps(
        &mut self,
        field_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<i64, RepositoryError>;

    /// Hourly price of a field, read inside the transaction.
    async fn get_field_price(&mut self, field_id: Uuid) -> Result<i64, RepositoryError>;

    /// Insert a booking. Fails with [`RepositoryError::Overlap`] when the storage-level
    /// exclusion constraint rejects it.
    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, RepositoryError>;

    /// Lock a booking row for the rest of the transaction and return it.
    async fn lock_booking(&mut self, id: Uuid) -> Result<Booking, RepositoryError>;

    async fn set_booking_status(
        &mut self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Apply a gateway status to a payment attempt and return the updated row.
    ///
    /// A payment already PAID or SETTLED keeps its status and method when the update
    /// reports an unpaid status (see [`model::PaymentStatus::followed_by`]).
    async fn update_payment_status(
        &mut self,
        update: &PaymentStatusUpdate,
    ) -> Result<Payment, RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}
