use async_trait::async_trait;
use model::BookingConfirmation;
use tracing::info;

/// Outbound booking notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_booking_confirmation(
        &self,
        confirmation: &BookingConfirmation,
    ) -> anyhow::Result<()>;
}

/// Notifier that writes a structured log line instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_booking_confirmation(
        &self,
        confirmation: &BookingConfirmation,
    ) -> anyhow::Result<()> {
        info!(
            booking_id = %confirmation.booking_id,
            user_id = %confirmation.user_id,
            date = %confirmation.booking_date,
            start = %confirmation.start_time,
            end = %confirmation.end_time,
            amount = confirmation.total_amount,
            method = %confirmation.payment_method,
            "Booking confirmed"
        );
        Ok(())
    }
}
