//! Domain model of the field booking backend: bookings and their status machine,
//! payments, pricing, time rules, and the DTOs exchanged with the delivery layer.

pub mod booking;
pub mod dto;
pub mod payment;
pub mod pricing;
pub mod time;

pub use booking::{
    Actor, Booking, BookingStatus, CancelBooking, CanceledBy, NewBooking, ParseRoleError,
    ParseStatusError, Role, TimeSlot,
};
pub use dto::{
    BookedSlot, BookedSlotsResponse, BookingConfirmation, BookingResponse, BookingsPage,
    CreateBookingRequest, InvoiceSummary, Pagination, PaymentCallback, PaymentResponse,
};
pub use payment::{
    NewPayment, Payment, PaymentStatus, PaymentStatusUpdate, PAYMENT_METHOD_CASH,
    PAYMENT_METHOD_UNKNOWN,
};
pub use pricing::calculate_total_price;
pub use time::{Clock, FixedClock, SystemClock};
