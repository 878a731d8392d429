//! Payment adapter (invoice creation, cash receipts) and the gateway callback handler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use model::time::{format_date, format_time};
use model::{
    BookingConfirmation, BookingStatus, Clock, InvoiceSummary, NewPayment, PAYMENT_METHOD_CASH,
    PAYMENT_METHOD_UNKNOWN, PaymentCallback, PaymentResponse, PaymentStatus, PaymentStatusUpdate,
};
use repository::{BookingStore, RepositoryError};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    BookingCache, InvoiceGateway, InvoiceOrder, Notifier, PaymentSettings, ServiceError,
    ServiceMetrics, TaskPool,
};

/// What the booking engine needs from the payment side.
#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    /// Issue a gateway invoice for `order_id` and record a pending payment attempt.
    async fn create_invoice(
        &self,
        order_id: Uuid,
        amount: i64,
        payer_email: &str,
    ) -> Result<InvoiceSummary, ServiceError>;

    /// Record a payment settled at the counter.
    async fn record_cash_payment(
        &self,
        booking_id: Uuid,
        amount: i64,
    ) -> Result<InvoiceSummary, ServiceError>;
}

#[async_trait]
pub trait PaymentService: PaymentAdapter {
    /// Apply a gateway status notification. `token` is the shared secret sent along
    /// with the callback.
    ///
    /// The payment attempt and the booking status change commit together. A paid
    /// notification confirms a pending booking, a failed or expired one expires it;
    /// a booking that already left PENDING is never moved by a callback.
    async fn apply_payment_callback(
        &self,
        payload: &PaymentCallback,
        token: &str,
    ) -> Result<(), ServiceError>;

    async fn get_payments_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<PaymentResponse>, ServiceError>;
}

/// Result of one applied callback.
#[derive(Debug, Clone, Copy)]
struct CallbackOutcome {
    booking_id: Uuid,
    previous: BookingStatus,
    next: Option<BookingStatus>,
    /// Status stored on the payment, which differs from the reported one when a paid
    /// payment ignored a late unpaid notification.
    payment_status: PaymentStatus,
    total_price: i64,
}

impl CallbackOutcome {
    fn label(&self) -> &'static str {
        match self.next {
            Some(BookingStatus::Confirmed) => "confirmed",
            Some(BookingStatus::Expired) => "expired",
            _ => "recorded",
        }
    }
}

pub struct PaymentServiceImpl {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn InvoiceGateway>,
    notifier: Arc<dyn Notifier>,
    cache: BookingCache,
    tasks: Arc<TaskPool>,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
}

impl PaymentServiceImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn InvoiceGateway>,
        notifier: Arc<dyn Notifier>,
        cache: BookingCache,
        tasks: Arc<TaskPool>,
        metrics: Arc<ServiceMetrics>,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            cache,
            tasks,
            metrics,
            clock,
            settings,
        }
    }

    fn validate_invoice(&self, amount: i64, payer_email: &str) -> Result<(), ServiceError> {
        if amount < self.settings.min_amount {
            return Err(ServiceError::BadRequest(format!(
                "validation error: amount must be at least {}",
                self.settings.min_amount
            )));
        }
        if !is_plausible_email(payer_email) {
            return Err(ServiceError::BadRequest(
                "validation error: payer email is invalid".into(),
            ));
        }
        Ok(())
    }

    fn check_token(&self, token: &str) -> Result<(), ServiceError> {
        let expected = self.settings.callback_token.as_bytes();
        if expected.is_empty() || !constant_time_eq(expected, token.as_bytes()) {
            return Err(ServiceError::Unauthorized("invalid callback token".into()));
        }
        Ok(())
    }

    /// Payment update and booking transition in one transaction.
    async fn apply_in_tx(&self, update: &PaymentStatusUpdate) -> Result<CallbackOutcome, ServiceError> {
        let mut tx = self.store.begin().await?;

        let payment = tx.update_payment_status(update).await.map_err(|e| match e {
            RepositoryError::NotFound => ServiceError::NotFound(format!(
                "payment not found for booking ID: {}",
                update.booking_id
            )),
            other => other.into(),
        })?;
        let booking_id = payment.booking_id;
        if booking_id != update.booking_id {
            warn!(
                external_id = %update.booking_id,
                %booking_id,
                "Callback transaction id belongs to another booking"
            );
        }
        if payment.payment_status != update.payment_status {
            warn!(
                %booking_id,
                transaction_id = %payment.transaction_id,
                stored = %payment.payment_status,
                reported = %update.payment_status,
                "Ignoring unpaid status reported for a paid payment"
            );
        }

        let booking = tx.lock_booking(booking_id).await.map_err(|e| match e {
            RepositoryError::NotFound => ServiceError::NotFound("booking not found".into()),
            other => other.into(),
        })?;
        let next = booking.status.after_payment(payment.payment_status);
        if let Some(next) = next {
            tx.set_booking_status(booking_id, next, update.now).await?;
        }
        tx.commit().await?;

        Ok(CallbackOutcome {
            booking_id,
            previous: booking.status,
            next,
            payment_status: payment.payment_status,
            total_price: booking.total_price,
        })
    }

    async fn process_callback(
        &self,
        payload: &PaymentCallback,
        token: &str,
    ) -> Result<CallbackOutcome, ServiceError> {
        self.check_token(token)?;

        let booking_id = Uuid::parse_str(payload.external_id.trim()).map_err(|_| {
            ServiceError::BadRequest(format!("invalid external_id '{}'", payload.external_id))
        })?;
        let payment_status = PaymentStatus::from_gateway(&payload.status);
        let now = self.clock.now();
        let payment_method = payload
            .payment_method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(PAYMENT_METHOD_UNKNOWN)
            .to_string();
        let paid_at = payment_status
            .is_paid()
            .then(|| parse_paid_at(payload.paid_at.as_deref()).unwrap_or(now));
        let transaction_id = Some(payload.id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let update = PaymentStatusUpdate {
            transaction_id,
            booking_id,
            payment_status,
            payment_method: payment_method.clone(),
            paid_at,
            now,
        };

        let outcome = tokio::time::timeout(self.settings.tx_timeout, self.apply_in_tx(&update))
            .await
            .map_err(|_| {
                error!(%booking_id, "Callback transaction timed out and was rolled back");
                ServiceError::Internal("callback transaction timed out".into())
            })??;

        if payment_status.is_paid() {
            let reported = payload.paid_amount.or(payload.amount);
            if let Some(paid) = amount_mismatch(reported, outcome.total_price) {
                warn!(
                    booking_id = %outcome.booking_id,
                    paid,
                    total_price = outcome.total_price,
                    "Paid amount differs from the booking price, needs reconciliation"
                );
            }
        }

        match outcome.next {
            Some(next) => info!(
                booking_id = %outcome.booking_id,
                from = %outcome.previous,
                to = %next,
                payment_status = %outcome.payment_status,
                "Booking status updated from payment callback"
            ),
            None if payment_status.is_paid() && outcome.previous.is_terminal() => warn!(
                booking_id = %outcome.booking_id,
                status = %outcome.previous,
                "Payment received for a booking that is no longer active, needs reconciliation"
            ),
            None => info!(
                booking_id = %outcome.booking_id,
                status = %outcome.previous,
                payment_status = %outcome.payment_status,
                "Payment status recorded, booking unchanged"
            ),
        }

        self.cache.invalidate_bookings(Some(outcome.booking_id));
        if outcome.next == Some(BookingStatus::Confirmed) {
            self.notify_confirmation(outcome.booking_id, payment_method, now);
        }
        Ok(outcome)
    }

    fn notify_confirmation(&self, booking_id: Uuid, payment_method: String, confirmed_at: DateTime<Utc>) {
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        self.tasks.submit("booking_confirmation", async move {
            let booking = store
                .get_booking_by_id(booking_id)
                .await
                .map_err(|e| format!("loading booking {booking_id}: {e}"))?;
            let confirmation = BookingConfirmation {
                booking_id,
                user_id: booking.user_id,
                status: booking.status,
                booking_date: format_date(booking.booking_date),
                start_time: format_time(booking.start_time),
                end_time: format_time(booking.end_time),
                total_amount: booking.total_price,
                payment_method,
                confirmed_at,
            };
            notifier
                .send_booking_confirmation(&confirmation)
                .await
                .map_err(|e| format!("notifying booking {booking_id}: {e:#}"))
        });
    }
}

#[async_trait]
impl PaymentAdapter for PaymentServiceImpl {
    #[instrument(skip(self, payer_email))]
    async fn create_invoice(
        &self,
        order_id: Uuid,
        amount: i64,
        payer_email: &str,
    ) -> Result<InvoiceSummary, ServiceError> {
        self.validate_invoice(amount, payer_email)?;

        let order = InvoiceOrder {
            external_id: order_id.to_string(),
            amount,
            payer_email: payer_email.trim().to_string(),
            description: format!("Field booking {order_id}"),
        };
        let invoice = self.gateway.create_invoice(&order).await.map_err(|e| {
            error!(%order_id, error = %e, "Invoice creation failed");
            ServiceError::Internal(format!("failed to create invoice: {e}"))
        })?;

        let payment = NewPayment {
            id: Uuid::new_v4(),
            booking_id: order_id,
            payment_method: PAYMENT_METHOD_UNKNOWN.to_string(),
            payment_status: PaymentStatus::from_gateway(&invoice.status),
            transaction_id: invoice.id.clone(),
            paid_at: None,
            created_at: self.clock.now(),
        };
        self.store.insert_payment(&payment).await?;
        info!(%order_id, invoice_id = %invoice.id, "Invoice issued");

        Ok(InvoiceSummary {
            id: invoice.id,
            order_id: order_id.to_string(),
            amount,
            status: if invoice.status.is_empty() {
                PaymentStatus::Pending.to_string()
            } else {
                invoice.status
            },
            expiry_date: invoice.expiry_date,
            payment_url: invoice.invoice_url,
        })
    }

    #[instrument(skip(self))]
    async fn record_cash_payment(
        &self,
        booking_id: Uuid,
        amount: i64,
    ) -> Result<InvoiceSummary, ServiceError> {
        let now = self.clock.now();
        let transaction_id = format!("CASH-{}", Uuid::new_v4().simple());
        let payment = NewPayment {
            id: Uuid::new_v4(),
            booking_id,
            payment_method: PAYMENT_METHOD_CASH.to_string(),
            payment_status: PaymentStatus::Paid,
            transaction_id: transaction_id.clone(),
            paid_at: Some(now),
            created_at: now,
        };
        self.store.insert_payment(&payment).await?;
        info!(%booking_id, %transaction_id, "Cash payment recorded");

        Ok(InvoiceSummary {
            id: transaction_id,
            order_id: booking_id.to_string(),
            amount,
            status: PaymentStatus::Paid.to_string(),
            expiry_date: None,
            payment_url: None,
        })
    }
}

#[async_trait]
impl PaymentService for PaymentServiceImpl {
    #[instrument(skip(self, payload, token), fields(external_id = %payload.external_id, status = %payload.status))]
    async fn apply_payment_callback(
        &self,
        payload: &PaymentCallback,
        token: &str,
    ) -> Result<(), ServiceError> {
        let result = self.process_callback(payload, token).await;
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(ServiceError::Unauthorized(_)) => "unauthorized",
            Err(ServiceError::Internal(_)) => "failed",
            Err(_) => "rejected",
        };
        self.metrics.record_callback(outcome);
        if let Err(e) = &result {
            warn!(error = %e, outcome, "Payment callback not applied");
        }
        result.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn get_payments_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<PaymentResponse>, ServiceError> {
        let payments = self.store.get_payments_by_booking(booking_id).await?;
        Ok(payments.iter().map(PaymentResponse::from).collect())
    }
}

fn parse_paid_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// The reported amount when it is present and differs from `expected`.
fn amount_mismatch(reported: Option<i64>, expected: i64) -> Option<i64> {
    reported.filter(|paid| *paid != expected)
}

fn is_plausible_email(email: &str) -> bool {
    let email = email.trim();
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
