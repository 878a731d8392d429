//! In-process implementation of [`BookingStore`] with the same semantics as the
//! PostgreSQL one, including the overlap exclusion on insert.
//!
//! A transaction holds the store lock for its whole lifetime and works on a staged copy
//! of the state, which is written back on commit and discarded on drop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use model::time::overlaps;
use model::{
    Booking, BookingStatus, CancelBooking, CanceledBy, NewBooking, NewPayment, Payment,
    PaymentStatusUpdate, TimeSlot,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{BookingStore, BookingTx, RepositoryError};

#[derive(Debug, Clone, Default)]
struct State {
    /// Field id to hourly price.
    fields: HashMap<Uuid, i64>,
    bookings: HashMap<Uuid, Booking>,
    payments: Vec<Payment>,
}

impl State {
    fn overlapping(
        &self,
        field_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> impl Iterator<Item = &Booking> {
        self.bookings.values().filter(move |b| {
            b.field_id == field_id
                && b.booking_date == date
                && b.occupies_slot()
                && overlaps(b.start_time, b.end_time, start, end)
        })
    }

    fn user_bookings(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
    ) -> impl Iterator<Item = &Booking> {
        self.bookings.values().filter(move |b| {
            b.user_id == user_id
                && b.deleted_at.is_none()
                && status.is_none_or(|s| b.status == s)
        })
    }
}

/// Booking store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBookingStore {
    state: Arc<Mutex<State>>,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bookable field.
    pub async fn add_field(&self, field_id: Uuid, price_per_hour: i64) {
        self.state.lock().await.fields.insert(field_id, price_per_hour);
    }

    /// Insert or replace a booking row as is, bypassing every check.
    pub async fn put_booking(&self, booking: Booking) {
        self.state.lock().await.bookings.insert(booking.id, booking);
    }

    /// Snapshot of all booking rows.
    pub async fn bookings(&self) -> Vec<Booking> {
        self.state.lock().await.bookings.values().cloned().collect()
    }

    /// Snapshot of all payment rows in insertion order.
    pub async fn payments(&self) -> Vec<Payment> {
        self.state.lock().await.payments.clone()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn begin(&self) -> Result<Box<dyn BookingTx>, RepositoryError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryBookingTx { guard, staged }))
    }

    async fn get_booking_by_id(&self, id: Uuid) -> Result<Booking, RepositoryError> {
        let state = self.state.lock().await;
        state
            .bookings
            .get(&id)
            .filter(|b| b.deleted_at.is_none())
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, RepositoryError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Booking> = state.user_bookings(user_id, status).cloned().collect();
        rows.sort_by(|a, b| {
            (b.booking_date, b.start_time, b.created_at).cmp(&(
                a.booking_date,
                a.start_time,
                a.created_at,
            ))
        });
        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
    ) -> Result<i64, RepositoryError> {
        let state = self.state.lock().await;
        let count = state.user_bookings(user_id, status).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn get_booked_slots(
        &self,
        field_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, RepositoryError> {
        let state = self.state.lock().await;
        let mut slots: Vec<TimeSlot> = state
            .bookings
            .values()
            .filter(|b| b.field_id == field_id && b.booking_date == date && b.occupies_slot())
            .map(|b| TimeSlot {
                start_time: b.start_time,
                end_time: b.end_time,
            })
            .collect();
        slots.sort_by_key(|s| s.start_time);
        Ok(slots)
    }

    async fn cancel_booking(&self, cancel: &CancelBooking) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(booking) = state.bookings.get_mut(&cancel.booking_id) else {
            return Ok(0);
        };
        let owned = cancel.user_id.is_none_or(|u| booking.user_id == u);
        let allowed = cancel.canceled_by.cancellable_from().contains(&booking.status);
        if !owned || !allowed || booking.deleted_at.is_some() {
            return Ok(0);
        }
        booking.status = BookingStatus::Cancelled;
        booking.canceled_at = Some(cancel.now);
        booking.canceled_by = Some(cancel.canceled_by);
        booking.updated_at = cancel.now;
        Ok(1)
    }

    async fn cancel_unsettled(
        &self,
        id: Uuid,
        canceled_by: CanceledBy,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(booking) = state.bookings.get_mut(&id) else {
            return Ok(0);
        };
        let unsettled = matches!(booking.status, BookingStatus::Pending | BookingStatus::Paid);
        if !unsettled || booking.deleted_at.is_some() {
            return Ok(0);
        }
        booking.status = BookingStatus::Cancelled;
        booking.canceled_at = Some(now);
        booking.canceled_by = Some(canceled_by);
        booking.updated_at = now;
        Ok(1)
    }

    async fn expire_old_bookings(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for booking in state.bookings.values_mut() {
            if booking.status == BookingStatus::Pending
                && booking.expires_at < now
                && booking.deleted_at.is_none()
            {
                booking.status = BookingStatus::Expired;
                booking.updated_at = now;
                expired.push(booking.id);
            }
        }
        Ok(expired)
    }

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, RepositoryError> {
        let mut state = self.state.lock().await;
        if state
            .payments
            .iter()
            .any(|p| p.transaction_id == payment.transaction_id)
        {
            return Err(RepositoryError::Duplicate(payment.transaction_id.clone()));
        }
        let row = payment.clone().into_payment();
        state.payments.push(row.clone());
        Ok(row)
    }

    async fn get_payments_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Payment>, RepositoryError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Payment> = state
            .payments
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows)
    }
}

/// Transaction over a [`MemoryBookingStore`].
pub struct MemoryBookingTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl BookingTx for MemoryBookingTx {
    async fn lock_slot(&mut self, _field_id: Uuid, _date: NaiveDate) -> Result<(), RepositoryError> {
        // The store lock already serializes every transaction.
        Ok(())
    }

    async fn count_overlaps(
        &mut self,
        field_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<i64, RepositoryError> {
        let count = self.staged.overlapping(field_id, date, start, end).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn get_field_price(&mut self, field_id: Uuid) -> Result<i64, RepositoryError> {
        self.staged
            .fields
            .get(&field_id)
            .copied()
            .ok_or(RepositoryError::NotFound)
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, RepositoryError> {
        if booking.status.is_active()
            && self
                .staged
                .overlapping(
                    booking.field_id,
                    booking.booking_date,
                    booking.start_time,
                    booking.end_time,
                )
                .next()
                .is_some()
        {
            return Err(RepositoryError::Overlap);
        }
        if self.staged.bookings.contains_key(&booking.id) {
            return Err(RepositoryError::Duplicate(booking.id.to_string()));
        }
        let row = booking.clone().into_booking();
        self.staged.bookings.insert(row.id, row.clone());
        Ok(row)
    }

    async fn lock_booking(&mut self, id: Uuid) -> Result<Booking, RepositoryError> {
        self.staged
            .bookings
            .get(&id)
            .filter(|b| b.deleted_at.is_none())
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn set_booking_status(
        &mut self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let booking = self
            .staged
            .bookings
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        booking.status = status;
        booking.updated_at = now;
        Ok(())
    }

    async fn update_payment_status(
        &mut self,
        update: &PaymentStatusUpdate,
    ) -> Result<Payment, RepositoryError> {
        let payments = &mut self.staged.payments;
        let by_transaction = update
            .transaction_id
            .as_deref()
            .and_then(|tx| payments.iter().position(|p| p.transaction_id == tx));
        let index = by_transaction
            .or_else(|| {
                payments
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.booking_id == update.booking_id)
                    .max_by_key(|(_, p)| p.created_at)
                    .map(|(i, _)| i)
            })
            .ok_or(RepositoryError::NotFound)?;

        let payment = &mut payments[index];
        let kept = payment.payment_status.followed_by(update.payment_status);
        if kept == update.payment_status {
            payment.payment_status = kept;
            payment.payment_method = update.payment_method.clone();
        }
        if update.paid_at.is_some() {
            payment.paid_at = update.paid_at;
        }
        payment.updated_at = update.now;
        Ok(payment.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let MemoryBookingTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
