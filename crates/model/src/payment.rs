use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Method recorded for payments settled at the counter.
pub const PAYMENT_METHOD_CASH: &str = "CASH";
/// Method recorded until the gateway reports how the payer paid.
pub const PAYMENT_METHOD_UNKNOWN: &str = "UNKNOWN";

/// Status of a payment attempt as reported by the gateway (or set locally for cash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Settled,
    Expired,
    Failed,
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Settled => "SETTLED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Unknown => "UNKNOWN",
        }
    }

    /// Lenient mapping of a gateway status string. An empty status means the
    /// gateway has not decided yet.
    pub fn from_gateway(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "" | "PENDING" => PaymentStatus::Pending,
            "PAID" => PaymentStatus::Paid,
            "SETTLED" => PaymentStatus::Settled,
            "EXPIRED" => PaymentStatus::Expired,
            "FAILED" => PaymentStatus::Failed,
            _ => PaymentStatus::Unknown,
        }
    }

    pub fn is_paid(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Settled)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, PaymentStatus::Expired | PaymentStatus::Failed)
    }

    /// Status kept after the gateway reports `reported`. A paid payment never goes
    /// back to an unpaid status; late or reordered notifications are ignored.
    pub fn followed_by(self, reported: PaymentStatus) -> PaymentStatus {
        if self.is_paid() && !reported.is_paid() {
            self
        } else {
            reported
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted payment attempt. A booking may have several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payment_method: String,
    pub payment_status: PaymentStatus,
    pub transaction_id: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payment_method: String,
    pub payment_status: PaymentStatus,
    pub transaction_id: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewPayment {
    pub fn into_payment(self) -> Payment {
        Payment {
            id: self.id,
            booking_id: self.booking_id,
            payment_method: self.payment_method,
            payment_status: self.payment_status,
            transaction_id: self.transaction_id,
            paid_at: self.paid_at,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Status change reported by the gateway for one payment attempt.
///
/// The payment is matched by `transaction_id` first; when that finds nothing the most
/// recent payment of `booking_id` is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentStatusUpdate {
    pub transaction_id: Option<String>,
    pub booking_id: Uuid,
    pub payment_status: PaymentStatus,
    pub payment_method: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}
