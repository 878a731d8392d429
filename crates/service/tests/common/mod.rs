#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cache::{CacheKeys, MemoryCache};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use model::{
    Actor, Booking, BookingConfirmation, BookingStatus, CancelBooking, CanceledBy,
    CreateBookingRequest, FixedClock, NewBooking, NewPayment, Payment, PaymentStatusUpdate, Role,
    TimeSlot,
};
use repository::{BookingStore, BookingTx, MemoryBookingStore, RepositoryError};
use service::{
    BookingCache, BookingServiceImpl, BookingSettings, ExpirationSweeper, GatewayError,
    GatewayInvoice, InvoiceGateway, InvoiceOrder, Notifier, PaymentServiceImpl, PaymentSettings,
    ServiceMetrics, TaskPool,
};
use uuid::Uuid;

pub const CALLBACK_TOKEN: &str = "cb-token";
pub const PRICE_PER_HOUR: i64 = 100_000;
/// A day after [`start`] in the application timezone.
pub const BOOKING_DATE: &str = "2024-01-02";

/// 2024-01-01 07:00 in Asia/Jakarta.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Gateway double that records orders and can be switched to fail.
#[derive(Default)]
pub struct FakeGateway {
    pub orders: Mutex<Vec<InvoiceOrder>>,
    pub fail: AtomicBool,
    issued: AtomicUsize,
}

impl FakeGateway {
    pub fn orders(&self) -> Vec<InvoiceOrder> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl InvoiceGateway for FakeGateway {
    async fn create_invoice(&self, order: &InvoiceOrder) -> Result<GatewayInvoice, GatewayError> {
        self.orders.lock().unwrap().push(order.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayInvoice {
            id: format!("inv-{n}"),
            status: "PENDING".into(),
            invoice_url: Some(format!("https://pay.example.com/inv-{n}")),
            expiry_date: Some("2024-01-02T00:00:00.000Z".into()),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<BookingConfirmation>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_booking_confirmation(
        &self,
        confirmation: &BookingConfirmation,
    ) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(confirmation.clone());
        Ok(())
    }
}

/// Pauses injected into transactions of a [`SlowStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Delays {
    pub field_price: Duration,
    pub commit: Duration,
}

/// Memory store whose transactions stall at chosen steps.
pub struct SlowStore {
    inner: Arc<MemoryBookingStore>,
    delays: Delays,
}

#[async_trait]
impl BookingStore for SlowStore {
    async fn begin(&self) -> Result<Box<dyn BookingTx>, RepositoryError> {
        Ok(Box::new(SlowTx {
            inner: self.inner.begin().await?,
            delays: self.delays,
        }))
    }

    async fn get_booking_by_id(&self, id: Uuid) -> Result<Booking, RepositoryError> {
        self.inner.get_booking_by_id(id).await
    }

    async fn get_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, RepositoryError> {
        self.inner
            .get_bookings_by_user(user_id, status, limit, offset)
            .await
    }

    async fn count_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
    ) -> Result<i64, RepositoryError> {
        self.inner.count_bookings_by_user(user_id, status).await
    }

    async fn get_booked_slots(
        &self,
        field_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, RepositoryError> {
        self.inner.get_booked_slots(field_id, date).await
    }

    async fn cancel_booking(&self, cancel: &CancelBooking) -> Result<u64, RepositoryError> {
        self.inner.cancel_booking(cancel).await
    }

    async fn cancel_unsettled(
        &self,
        id: Uuid,
        canceled_by: CanceledBy,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        self.inner.cancel_unsettled(id, canceled_by, now).await
    }

    async fn expire_old_bookings(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        self.inner.expire_old_bookings(now).await
    }

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, RepositoryError> {
        self.inner.insert_payment(payment).await
    }

    async fn get_payments_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Payment>, RepositoryError> {
        self.inner.get_payments_by_booking(booking_id).await
    }
}

struct SlowTx {
    inner: Box<dyn BookingTx>,
    delays: Delays,
}

#[async_trait]
impl BookingTx for SlowTx {
    async fn lock_slot(&mut self, field_id: Uuid, date: NaiveDate) -> Result<(), RepositoryError> {
        self.inner.lock_slot(field_id, date).await
    }

    async fn count_overlaps(
        &mut self,
        field_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<i64, RepositoryError> {
        self.inner.count_overlaps(field_id, date, start, end).await
    }

    async fn get_field_price(&mut self, field_id: Uuid) -> Result<i64, RepositoryError> {
        tokio::time::sleep(self.delays.field_price).await;
        self.inner.get_field_price(field_id).await
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, RepositoryError> {
        self.inner.insert_booking(booking).await
    }

    async fn lock_booking(&mut self, id: Uuid) -> Result<Booking, RepositoryError> {
        self.inner.lock_booking(id).await
    }

    async fn set_booking_status(
        &mut self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.inner.set_booking_status(id, status, now).await
    }

    async fn update_payment_status(
        &mut self,
        update: &PaymentStatusUpdate,
    ) -> Result<Payment, RepositoryError> {
        self.inner.update_payment_status(update).await
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        tokio::time::sleep(self.delays.commit).await;
        self.inner.commit().await
    }
}

/// Booking engine, payment service and sweeper wired over in-memory doubles.
pub struct Harness {
    pub store: Arc<MemoryBookingStore>,
    pub cache: Arc<MemoryCache>,
    pub tasks: Arc<TaskPool>,
    pub metrics: Arc<ServiceMetrics>,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub bookings: Arc<BookingServiceImpl>,
    pub payments: Arc<PaymentServiceImpl>,
    pub sweeper: ExpirationSweeper,
    pub field_id: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_price(PRICE_PER_HOUR).await
    }

    pub async fn with_price(price_per_hour: i64) -> Self {
        Self::build(price_per_hour, None, Duration::from_secs(5)).await
    }

    /// Services run over a [`SlowStore`] with the given transaction deadline; `store`
    /// still exposes the underlying rows.
    pub async fn slow(delays: Delays, tx_timeout: Duration) -> Self {
        Self::build(PRICE_PER_HOUR, Some(delays), tx_timeout).await
    }

    async fn build(price_per_hour: i64, delays: Option<Delays>, tx_timeout: Duration) -> Self {
        let store = Arc::new(MemoryBookingStore::new());
        let field_id = Uuid::new_v4();
        store.add_field(field_id, price_per_hour).await;
        let backend: Arc<dyn BookingStore> = match delays {
            Some(delays) => Arc::new(SlowStore {
                inner: store.clone(),
                delays,
            }),
            None => store.clone() as Arc<dyn BookingStore>,
        };

        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let tasks = Arc::new(TaskPool::new(2, 64, metrics.clone()));
        let cache = Arc::new(MemoryCache::new());
        let layer = BookingCache::new(
            cache.clone(),
            CacheKeys::new("test"),
            tasks.clone(),
            Duration::from_secs(300),
        );
        let clock = Arc::new(FixedClock::new(start()));
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let payments = Arc::new(PaymentServiceImpl::new(
            backend.clone(),
            gateway.clone(),
            notifier.clone(),
            layer.clone(),
            tasks.clone(),
            metrics.clone(),
            clock.clone(),
            PaymentSettings {
                callback_token: CALLBACK_TOKEN.into(),
                min_amount: 10_000,
                tx_timeout,
            },
        ));
        let bookings = Arc::new(BookingServiceImpl::new(
            backend.clone(),
            payments.clone(),
            layer.clone(),
            metrics.clone(),
            clock.clone(),
            BookingSettings {
                timezone: chrono_tz::Asia::Jakarta,
                grace_period: TimeDelta::minutes(30),
                tx_timeout,
            },
        ));
        let sweeper = ExpirationSweeper::new(
            backend,
            layer,
            metrics.clone(),
            clock.clone(),
            Duration::from_secs(60),
        );

        Self {
            store,
            cache,
            tasks,
            metrics,
            clock,
            gateway,
            notifier,
            bookings,
            payments,
            sweeper,
            field_id,
        }
    }

    pub fn request(&self, start_time: &str, duration_minutes: i64) -> CreateBookingRequest {
        CreateBookingRequest {
            field_id: self.field_id,
            date: BOOKING_DATE.into(),
            start_time: start_time.into(),
            duration_minutes,
            cash: false,
        }
    }

    pub fn metric(&self, line: &str) -> bool {
        self.metrics.render().unwrap().lines().any(|l| l == line)
    }
}

pub fn user() -> Actor {
    actor(Role::User)
}

pub fn actor(role: Role) -> Actor {
    Actor {
        user_id: Uuid::new_v4(),
        email: "player@example.com".into(),
        role,
    }
}
