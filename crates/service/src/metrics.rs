use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// ServiceMetrics collects and exposes booking lifecycle metrics.
///
/// The registry is shared: the delivery layer registers its own collectors into it and
/// renders everything from one `/metrics` endpoint.
pub struct ServiceMetrics {
    registry: Registry,
    bookings_created_total: IntCounterVec,
    booking_conflicts_total: IntCounter,
    bookings_expired_total: IntCounter,
    payment_callbacks_total: IntCounterVec,
    background_tasks_total: IntCounterVec,
    booking_transaction_seconds: Histogram,
}

impl ServiceMetrics {
    /// # Errors
    /// Returns an error if a collector cannot be created or registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let bookings_created_total = IntCounterVec::new(
            Opts::new("bookings_created_total", "Bookings committed, by settlement"),
            &["settlement"],
        )?;
        let booking_conflicts_total = IntCounter::new(
            "booking_conflicts_total",
            "Booking requests rejected because the slot was taken",
        )?;
        let bookings_expired_total = IntCounter::new(
            "bookings_expired_total",
            "Pending bookings moved to EXPIRED by the sweeper",
        )?;
        let payment_callbacks_total = IntCounterVec::new(
            Opts::new("payment_callbacks_total", "Payment gateway callbacks, by outcome"),
            &["outcome"],
        )?;
        let background_tasks_total = IntCounterVec::new(
            Opts::new("background_tasks_total", "Post-commit background tasks, by outcome"),
            &["task", "outcome"],
        )?;
        let booking_transaction_seconds = Histogram::with_opts(HistogramOpts::new(
            "booking_transaction_seconds",
            "Duration of the booking creation transaction",
        ))?;

        registry.register(Box::new(bookings_created_total.clone()))?;
        registry.register(Box::new(booking_conflicts_total.clone()))?;
        registry.register(Box::new(bookings_expired_total.clone()))?;
        registry.register(Box::new(payment_callbacks_total.clone()))?;
        registry.register(Box::new(background_tasks_total.clone()))?;
        registry.register(Box::new(booking_transaction_seconds.clone()))?;

        Ok(Self {
            registry,
            bookings_created_total,
            booking_conflicts_total,
            bookings_expired_total,
            payment_callbacks_total,
            background_tasks_total,
            booking_transaction_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_booking_created(&self, settlement: &str) {
        self.bookings_created_total
            .with_label_values(&[settlement])
            .inc();
    }

    pub fn record_conflict(&self) {
        self.booking_conflicts_total.inc();
    }

    pub fn record_expired(&self, count: u64) {
        self.bookings_expired_total.inc_by(count);
    }

    pub fn record_callback(&self, outcome: &str) {
        self.payment_callbacks_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_task(&self, task: &str, outcome: &str) {
        self.background_tasks_total
            .with_label_values(&[task, outcome])
            .inc();
    }

    /// Observes the transaction duration when the returned timer is dropped.
    pub fn transaction_timer(&self) -> HistogramTimer {
        self.booking_transaction_seconds.start_timer()
    }

    /// Text exposition of every collector in the registry.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self, task: &str, outcome: &str) -> u64 {
        self.background_tasks_total
            .with_label_values(&[task, outcome])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self, outcome: &str) -> u64 {
        self.payment_callbacks_total
            .with_label_values(&[outcome])
            .get()
    }
}
