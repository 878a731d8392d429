//! Request and response shapes exchanged with the delivery layer, and the
//! serialized values held in the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus, TimeSlot};
use crate::payment::Payment;
use crate::time::{format_date, format_time};

pub const PAGINATION_DEFAULT_PAGE: i64 = 1;
pub const PAGINATION_DEFAULT_LIMIT: i64 = 10;
pub const PAGINATION_MAX_LIMIT: i64 = 100;

/// Request to reserve one slot of a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateBookingRequest {
    pub field_id: Uuid,
    /// `YYYY-MM-DD` in the application timezone.
    pub date: String,
    /// `HH:MM` in the application timezone.
    pub start_time: String,
    pub duration_minutes: i64,
    /// Settle at the counter instead of through the gateway. Staff only.
    #[serde(default)]
    pub cash: bool,
}

/// Result of a booking creation: the invoice (or cash receipt) the caller must act on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceSummary {
    pub id: String,
    pub order_id: String,
    pub amount: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingResponse {
    pub id: String,
    pub user_id: String,
    pub field_id: String,
    pub booking_date: String,
    pub start_time: String,
    pub end_time: String,
    pub total_price: i64,
    pub status: BookingStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Booking> for BookingResponse {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id.to_string(),
            user_id: b.user_id.to_string(),
            field_id: b.field_id.to_string(),
            booking_date: format_date(b.booking_date),
            start_time: format_time(b.start_time),
            end_time: format_time(b.end_time),
            total_price: b.total_price,
            status: b.status,
            expires_at: b.expires_at,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingsPage {
    pub bookings: Vec<BookingResponse>,
    pub total_items: i64,
    pub total_pages: i64,
}

impl BookingsPage {
    pub fn new(bookings: &[Booking], total_items: i64, limit: i64) -> Self {
        Self {
            bookings: bookings.iter().map(BookingResponse::from).collect(),
            total_items,
            total_pages: calculate_total_pages(total_items, limit),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookedSlot {
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookedSlotsResponse {
    pub field_id: String,
    pub booked_slots: Vec<BookedSlot>,
    pub total_items: usize,
}

impl BookedSlotsResponse {
    pub fn new(field_id: Uuid, slots: &[TimeSlot]) -> Self {
        Self {
            field_id: field_id.to_string(),
            booked_slots: slots
                .iter()
                .map(|s| BookedSlot {
                    start_time: format_time(s.start_time),
                    end_time: format_time(s.end_time),
                })
                .collect(),
            total_items: slots.len(),
        }
    }
}

/// Page/limit/filter query for user listings. Zero or negative values fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub limit: i64,
    /// Booking status to filter by; empty means all statuses.
    #[serde(default)]
    pub filter: String,
}

impl Pagination {
    /// Effective `(page, limit)`.
    pub fn normalized(&self) -> (i64, i64) {
        let page = if self.page <= 0 {
            PAGINATION_DEFAULT_PAGE
        } else {
            self.page
        };
        let limit = if self.limit <= 0 {
            PAGINATION_DEFAULT_LIMIT
        } else {
            self.limit.min(PAGINATION_MAX_LIMIT)
        };
        (page, limit)
    }

    pub fn offset(&self) -> i64 {
        let (page, limit) = self.normalized();
        (page - 1).saturating_mul(limit)
    }
}

pub fn calculate_total_pages(total_items: i64, limit: i64) -> i64 {
    if total_items <= 0 || limit <= 0 {
        return 1;
    }
    (total_items + limit - 1) / limit
}

/// Invoice status notification posted by the payment gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentCallback {
    /// Gateway invoice id; matches `payments.transaction_id`.
    #[serde(default)]
    pub id: String,
    /// Our order id, i.e. the booking id.
    pub external_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub paid_at: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub paid_amount: Option<i64>,
    #[serde(default)]
    pub payer_email: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentResponse {
    pub id: String,
    pub booking_id: String,
    pub payment_method: String,
    pub payment_status: String,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Payment> for PaymentResponse {
    fn from(p: &Payment) -> Self {
        Self {
            id: p.id.to_string(),
            booking_id: p.booking_id.to_string(),
            payment_method: p.payment_method.clone(),
            payment_status: p.payment_status.to_string(),
            transaction_id: p.transaction_id.clone(),
            paid_at: p.paid_at,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// Details handed to the notifier once a booking is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingConfirmation {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub status: BookingStatus,
    pub booking_date: String,
    pub start_time: String,
    pub end_time: String,
    pub total_amount: i64,
    pub payment_method: String,
    pub confirmed_at: DateTime<Utc>,
}
