//! Booking engine: creation, cancellation and cache-fronted reads.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use model::time::{end_time, is_in_future, parse_date, parse_time};
use model::{
    Actor, Booking, BookedSlotsResponse, BookingResponse, BookingStatus, BookingsPage,
    CancelBooking, CanceledBy, Clock, CreateBookingRequest, InvoiceSummary, NewBooking, Pagination,
    TimeSlot, calculate_total_price,
};
use prometheus::HistogramTimer;
use repository::{BookingStore, BookingTx, RepositoryError};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    BookingCache, BookingSettings, OVERLAP_MESSAGE, PaymentAdapter, ServiceError, ServiceMetrics,
};

/// Operations the delivery layer calls on bookings.
#[async_trait]
pub trait BookingService: Send + Sync {
    /// Reserve a slot and start its settlement.
    ///
    /// The booking is committed before the payment step runs. If that step fails the
    /// booking is cancelled by the system so the slot is released, and the payment
    /// error is returned.
    ///
    /// # Errors
    /// [`ServiceError::BadRequest`] for malformed or past times,
    /// [`ServiceError::Forbidden`] for cash by a non-staff actor,
    /// [`ServiceError::Conflict`] when the slot overlaps an active booking,
    /// [`ServiceError::NotFound`] for an unknown field.
    async fn create_booking(
        &self,
        req: &CreateBookingRequest,
        actor: &Actor,
    ) -> Result<InvoiceSummary, ServiceError>;

    async fn get_booking_by_id(&self, id: Uuid) -> Result<BookingResponse, ServiceError>;

    /// One page of a user's bookings, newest first, with totals.
    async fn get_user_bookings(
        &self,
        user_id: Uuid,
        page: &Pagination,
    ) -> Result<BookingsPage, ServiceError>;

    async fn count_user_bookings(
        &self,
        user_id: Uuid,
        page: &Pagination,
    ) -> Result<i64, ServiceError>;

    /// Intervals held by active bookings of a field on `date` (`YYYY-MM-DD`).
    async fn get_booked_slots(
        &self,
        field_id: Uuid,
        date: &str,
    ) -> Result<BookedSlotsResponse, ServiceError>;

    /// Cancel a still-pending booking on behalf of its owner.
    async fn cancel_user_booking(&self, booking_id: Uuid, user_id: Uuid)
    -> Result<(), ServiceError>;

    /// Cancel any active booking on behalf of staff.
    async fn cancel_booking(&self, booking_id: Uuid, actor: &Actor) -> Result<(), ServiceError>;
}

/// A validated creation request.
#[derive(Debug, Clone, Copy)]
struct SlotRequest {
    field_id: Uuid,
    date: NaiveDate,
    start: chrono::NaiveTime,
    end: chrono::NaiveTime,
    duration_minutes: i64,
    cash: bool,
}

/// Async implementation of [`BookingService`] over a [`BookingStore`].
pub struct BookingServiceImpl {
    store: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentAdapter>,
    cache: BookingCache,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<dyn Clock>,
    settings: BookingSettings,
}

impl BookingServiceImpl {
    pub fn new(
        store: Arc<dyn BookingStore>,
        payments: Arc<dyn PaymentAdapter>,
        cache: BookingCache,
        metrics: Arc<ServiceMetrics>,
        clock: Arc<dyn Clock>,
        settings: BookingSettings,
    ) -> Self {
        Self {
            store,
            payments,
            cache,
            metrics,
            clock,
            settings,
        }
    }

    fn validate(&self, req: &CreateBookingRequest, actor: &Actor) -> Result<SlotRequest, ServiceError> {
        let date = parse_date(&req.date).map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        let start =
            parse_time(&req.start_time).map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        let end = end_time(start, req.duration_minutes).ok_or_else(|| {
            ServiceError::BadRequest(
                "duration must be positive and the booking must end on the same day".into(),
            )
        })?;

        if !is_in_future(date, start, self.settings.timezone, self.clock.now()) {
            return Err(ServiceError::BadRequest(
                "booking time cannot be in the past".into(),
            ));
        }
        if req.cash && !actor.role.is_staff() {
            return Err(ServiceError::Forbidden(
                "only staff can accept cash payments".into(),
            ));
        }

        Ok(SlotRequest {
            field_id: req.field_id,
            date,
            start,
            end,
            duration_minutes: req.duration_minutes,
            cash: req.cash,
        })
    }

    /// Overlap check, pricing and insert inside a transaction that is returned still
    /// open. Dropping the returned future, or the transaction, rolls everything back.
    async fn stage_booking(
        &self,
        slot: SlotRequest,
        user_id: Uuid,
    ) -> Result<(Box<dyn BookingTx>, Booking), ServiceError> {
        let mut tx = self.store.begin().await?;
        tx.lock_slot(slot.field_id, slot.date).await?;

        let overlaps = tx
            .count_overlaps(slot.field_id, slot.date, slot.start, slot.end)
            .await?;
        if overlaps > 0 {
            self.metrics.record_conflict();
            warn!(overlaps, "Requested slot overlaps existing bookings");
            return Err(ServiceError::Conflict(OVERLAP_MESSAGE.into()));
        }

        let price_per_hour = tx.get_field_price(slot.field_id).await.map_err(|e| match e {
            RepositoryError::NotFound => ServiceError::NotFound("field not found".into()),
            other => other.into(),
        })?;

        let now = self.clock.now();
        let new_booking = NewBooking {
            id: Uuid::new_v4(),
            user_id,
            field_id: slot.field_id,
            booking_date: slot.date,
            start_time: slot.start,
            end_time: slot.end,
            total_price: calculate_total_price(price_per_hour, slot.duration_minutes),
            status: if slot.cash {
                BookingStatus::Paid
            } else {
                BookingStatus::Pending
            },
            expires_at: now + self.settings.grace_period,
            created_at: now,
        };

        let booking = tx.insert_booking(&new_booking).await.map_err(|e| {
            if matches!(e, RepositoryError::Overlap) {
                self.metrics.record_conflict();
            }
            ServiceError::from(e)
        })?;
        Ok((tx, booking))
    }

    fn parse_filter(filter: &str) -> Result<Option<BookingStatus>, ServiceError> {
        let filter = filter.trim();
        if filter.is_empty() {
            return Ok(None);
        }
        filter
            .parse::<BookingStatus>()
            .map(Some)
            .map_err(|e| ServiceError::BadRequest(e.to_string()))
    }

    /// Explain why a conditional cancel matched no row.
    async fn cancel_miss(&self, booking_id: Uuid, owner: Option<Uuid>) -> ServiceError {
        match self.store.get_booking_by_id(booking_id).await {
            Ok(booking) if owner.is_none_or(|u| u == booking.user_id) => ServiceError::Conflict(
                format!("booking can no longer be cancelled, status is {}", booking.status),
            ),
            Ok(_) | Err(RepositoryError::NotFound) => {
                ServiceError::NotFound("booking not found".into())
            }
            Err(e) => e.into(),
        }
    }
}

/// Commit and payment step of a staged booking. Runs on its own task so the caller
/// going away cannot interrupt the commit or skip the payment step and its
/// compensation.
struct Settlement {
    store: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentAdapter>,
    cache: BookingCache,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<dyn Clock>,
    booking: Booking,
    payer_email: String,
    cash: bool,
}

impl Settlement {
    async fn run(
        self,
        tx: Box<dyn BookingTx>,
        timer: HistogramTimer,
    ) -> Result<InvoiceSummary, ServiceError> {
        tx.commit().await?;
        timer.observe_duration();

        let booking_id = self.booking.id;
        info!(
            %booking_id,
            status = %self.booking.status,
            total_price = self.booking.total_price,
            "Booking created"
        );
        self.metrics
            .record_booking_created(if self.cash { "cash" } else { "gateway" });
        self.cache.invalidate_bookings(None);

        let result = if self.cash {
            self.payments
                .record_cash_payment(booking_id, self.booking.total_price)
                .await
        } else {
            self.payments
                .create_invoice(booking_id, self.booking.total_price, &self.payer_email)
                .await
        };

        let err = match result {
            Ok(summary) => return Ok(summary),
            Err(err) => err,
        };

        error!(%booking_id, error = %err, "Payment step failed, releasing the slot");
        match self
            .store
            .cancel_unsettled(booking_id, CanceledBy::System, self.clock.now())
            .await
        {
            Ok(0) => warn!(%booking_id, "Booking already left its unsettled state"),
            Ok(_) => info!(%booking_id, "Booking cancelled by system"),
            Err(e) => error!(
                %booking_id,
                error = %e,
                "Compensating cancellation failed, booking needs manual reconciliation"
            ),
        }
        self.cache.invalidate_bookings(Some(booking_id));
        Err(err)
    }
}

#[async_trait]
impl BookingService for BookingServiceImpl {
    #[instrument(skip(self, req, actor), fields(field_id = %req.field_id, user_id = %actor.user_id))]
    async fn create_booking(
        &self,
        req: &CreateBookingRequest,
        actor: &Actor,
    ) -> Result<InvoiceSummary, ServiceError> {
        let slot = self.validate(req, actor)?;

        // Only the steps before commit run under the deadline.
        let timer = self.metrics.transaction_timer();
        let (tx, booking) = tokio::time::timeout(
            self.settings.tx_timeout,
            self.stage_booking(slot, actor.user_id),
        )
        .await
        .map_err(|_| {
            error!("Booking transaction timed out and was rolled back");
            ServiceError::Internal("booking transaction timed out".into())
        })??;

        let settlement = Settlement {
            store: self.store.clone(),
            payments: self.payments.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            booking,
            payer_email: actor.email.clone(),
            cash: slot.cash,
        };
        tokio::spawn(settlement.run(tx, timer))
            .await
            .map_err(|e| ServiceError::Internal(format!("booking settlement task failed: {e}")))?
    }

    #[instrument(skip(self))]
    async fn get_booking_by_id(&self, id: Uuid) -> Result<BookingResponse, ServiceError> {
        let store = &self.store;
        let booking: Booking = self
            .cache
            .read_through(self.cache.booking_key(id), || async move {
                store.get_booking_by_id(id).await.map_err(|e| match e {
                    RepositoryError::NotFound => ServiceError::NotFound("booking not found".into()),
                    other => other.into(),
                })
            })
            .await?;
        Ok(BookingResponse::from(&booking))
    }

    #[instrument(skip(self, page))]
    async fn get_user_bookings(
        &self,
        user_id: Uuid,
        page: &Pagination,
    ) -> Result<BookingsPage, ServiceError> {
        let status = Self::parse_filter(&page.filter)?;
        let (_, limit) = page.normalized();
        let offset = page.offset();

        let store = &self.store;
        let bookings: Vec<Booking> = self
            .cache
            .read_through(self.cache.bookings_key(user_id, page), || async move {
                store
                    .get_bookings_by_user(user_id, status, limit, offset)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?;
        let total = self.count_user_bookings(user_id, page).await?;

        Ok(BookingsPage::new(&bookings, total, limit))
    }

    #[instrument(skip(self, page))]
    async fn count_user_bookings(
        &self,
        user_id: Uuid,
        page: &Pagination,
    ) -> Result<i64, ServiceError> {
        let status = Self::parse_filter(&page.filter)?;
        let store = &self.store;
        self.cache
            .read_through(self.cache.count_key(user_id, &page.filter), || async move {
                store
                    .count_bookings_by_user(user_id, status)
                    .await
                    .map_err(ServiceError::from)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_booked_slots(
        &self,
        field_id: Uuid,
        date: &str,
    ) -> Result<BookedSlotsResponse, ServiceError> {
        let date = parse_date(date).map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        let store = &self.store;
        let slots: Vec<TimeSlot> = self
            .cache
            .read_through(self.cache.slots_key(field_id, date), || async move {
                store
                    .get_booked_slots(field_id, date)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?;
        Ok(BookedSlotsResponse::new(field_id, &slots))
    }

    #[instrument(skip(self))]
    async fn cancel_user_booking(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), ServiceError> {
        let cancel = CancelBooking {
            booking_id,
            user_id: Some(user_id),
            canceled_by: CanceledBy::User,
            now: self.clock.now(),
        };
        if self.store.cancel_booking(&cancel).await? == 0 {
            return Err(self.cancel_miss(booking_id, Some(user_id)).await);
        }

        info!(%booking_id, "Booking cancelled by user");
        self.cache.invalidate_bookings(Some(booking_id));
        Ok(())
    }

    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    async fn cancel_booking(&self, booking_id: Uuid, actor: &Actor) -> Result<(), ServiceError> {
        if !actor.role.is_staff() {
            return Err(ServiceError::Forbidden(
                "only staff can cancel bookings of other users".into(),
            ));
        }
        let cancel = CancelBooking {
            booking_id,
            user_id: None,
            canceled_by: CanceledBy::Admin,
            now: self.clock.now(),
        };
        if self.store.cancel_booking(&cancel).await? == 0 {
            return Err(self.cancel_miss(booking_id, None).await);
        }

        info!(%booking_id, "Booking cancelled by staff");
        self.cache.invalidate_bookings(Some(booking_id));
        Ok(())
    }
}
