use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::payment::PaymentStatus;

/// Lifecycle status of a booking.
///
/// ```text
/// PENDING --(payment confirmed)--> CONFIRMED
/// PENDING --(cash by staff)------> PAID
/// PENDING --(sweeper)------------> EXPIRED
/// PENDING --(user/admin cancel)--> CANCELLED
/// CONFIRMED / PAID --(admin/system cancel)--> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "booking_status")]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingStatus {
    #[postgres(name = "PENDING")]
    Pending,
    #[postgres(name = "CONFIRMED")]
    Confirmed,
    #[postgres(name = "PAID")]
    Paid,
    #[postgres(name = "CANCELLED")]
    Cancelled,
    #[postgres(name = "EXPIRED")]
    Expired,
}

impl BookingStatus {
    /// Statuses that occupy a slot. The overlap check, the availability listing and the
    /// storage exclusion constraint all use exactly this set.
    pub const ACTIVE: [BookingStatus; 3] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Paid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Paid => "PAID",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Expired)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Paid)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Paid, Cancelled)
        )
    }

    /// Status a booking should move to after the gateway reports `payment`,
    /// or `None` when the booking stays as it is.
    pub fn after_payment(self, payment: PaymentStatus) -> Option<BookingStatus> {
        let next = if payment.is_paid() {
            BookingStatus::Confirmed
        } else if payment.is_failed() {
            BookingStatus::Expired
        } else {
            return None;
        };
        self.can_transition_to(next).then_some(next)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown booking status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for BookingStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "PAID" => Ok(BookingStatus::Paid),
            "CANCELLED" | "CANCELED" => Ok(BookingStatus::Cancelled),
            "EXPIRED" => Ok(BookingStatus::Expired),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Who cancelled a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "booking_canceled_by")]
#[serde(rename_all = "lowercase")]
pub enum CanceledBy {
    #[postgres(name = "user")]
    User,
    #[postgres(name = "admin")]
    Admin,
    #[postgres(name = "system")]
    System,
}

impl CanceledBy {
    /// Statuses this party is allowed to cancel from.
    pub fn cancellable_from(self) -> &'static [BookingStatus] {
        match self {
            CanceledBy::User => &[BookingStatus::Pending],
            CanceledBy::Admin | CanceledBy::System => &BookingStatus::ACTIVE,
        }
    }
}

/// Role of the acting user, as asserted by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Staff,
    Admin,
}

impl Role {
    /// Staff and admins may settle bookings in cash and cancel on behalf of users.
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role '{0}'")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "1" => Ok(Role::User),
            "staff" => Ok(Role::Staff),
            "admin" | "9" => Ok(Role::Admin),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

/// A persisted booking row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub field_id: Uuid,
    pub booking_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub total_price: i64,
    pub status: BookingStatus,
    pub expires_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<CanceledBy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// Whether this booking currently occupies its slot.
    pub fn occupies_slot(&self) -> bool {
        self.deleted_at.is_none() && self.status.is_active()
    }
}

/// Values for a booking insert; timestamps come from the engine's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub field_id: Uuid,
    pub booking_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub total_price: i64,
    pub status: BookingStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewBooking {
    /// Materializes the row a store would hold right after the insert.
    pub fn into_booking(self) -> Booking {
        Booking {
            id: self.id,
            user_id: self.user_id,
            field_id: self.field_id,
            booking_date: self.booking_date,
            start_time: self.start_time,
            end_time: self.end_time,
            total_price: self.total_price,
            status: self.status,
            expires_at: self.expires_at,
            canceled_at: None,
            canceled_by: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            deleted_at: None,
        }
    }
}

/// A conditional cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelBooking {
    pub booking_id: Uuid,
    /// When set, only a booking owned by this user matches.
    pub user_id: Option<Uuid>,
    pub canceled_by: CanceledBy,
    pub now: DateTime<Utc>,
}

/// An occupied `[start_time, end_time)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}
