mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use common::{CALLBACK_TOKEN, Harness, user};
use model::{BookingStatus, PaymentCallback, PaymentStatus};
use service::{BookingService, PaymentService, ServiceError};
use tokio::sync::Notify;
use uuid::Uuid;

async fn pending_booking(h: &Harness) -> Uuid {
    let invoice = h
        .bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap();
    invoice.order_id.parse().unwrap()
}

fn callback(booking_id: Uuid, status: &str) -> PaymentCallback {
    PaymentCallback {
        id: "inv-1".into(),
        external_id: booking_id.to_string(),
        status: status.into(),
        payment_method: Some("BANK_TRANSFER".into()),
        paid_at: Some("2024-01-01T00:10:00.000Z".into()),
        ..PaymentCallback::default()
    }
}

#[tokio::test]
async fn test_paid_callback_confirms_and_notifies() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    h.payments
        .apply_payment_callback(&callback(id, "PAID"), CALLBACK_TOKEN)
        .await
        .unwrap();
    h.tasks.wait_idle().await;

    let booking = h.bookings.get_booking_by_id(id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);

    let payments = h.payments.get_payments_by_booking(id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].payment_status, "PAID");
    assert_eq!(payments[0].payment_method, "BANK_TRANSFER");
    assert_eq!(
        payments[0].paid_at,
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap())
    );

    let sent = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].booking_id, id);
    assert_eq!(sent[0].total_amount, 100_000);
    assert_eq!(sent[0].payment_method, "BANK_TRANSFER");
    assert!(h.metric(r#"payment_callbacks_total{outcome="confirmed"} 1"#));
}

#[tokio::test]
async fn test_paid_callback_without_paid_at_uses_clock() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;
    h.clock.advance(TimeDelta::minutes(5));

    let mut cb = callback(id, "SETTLED");
    cb.paid_at = None;
    h.payments
        .apply_payment_callback(&cb, CALLBACK_TOKEN)
        .await
        .unwrap();

    let payment = h.store.payments().await.remove(0);
    assert_eq!(payment.payment_status, PaymentStatus::Settled);
    assert_eq!(payment.paid_at, Some(common::start() + TimeDelta::minutes(5)));
}

#[tokio::test]
async fn test_bad_token_is_rejected_without_changes() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    for token in ["", "wrong", "cb-token-2"] {
        let err = h
            .payments
            .apply_payment_callback(&callback(id, "PAID"), token)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Pending);
    assert_eq!(
        h.store.payments().await[0].payment_status,
        PaymentStatus::Pending
    );
    assert!(h.metric(r#"payment_callbacks_total{outcome="unauthorized"} 3"#));
}

#[tokio::test]
async fn test_expired_callback_expires_pending_booking() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    h.payments
        .apply_payment_callback(&callback(id, "EXPIRED"), CALLBACK_TOKEN)
        .await
        .unwrap();

    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Expired);
    let payment = h.store.payments().await.remove(0);
    assert_eq!(payment.payment_status, PaymentStatus::Expired);
    assert!(payment.paid_at.is_none());
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_callback_leaves_booking_unchanged() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    h.payments
        .apply_payment_callback(&callback(id, "PENDING"), CALLBACK_TOKEN)
        .await
        .unwrap();
    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Pending);
    assert!(h.metric(r#"payment_callbacks_total{outcome="recorded"} 1"#));
}

#[tokio::test]
async fn test_late_payment_does_not_revive_expired_booking() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    h.clock.advance(TimeDelta::minutes(31));
    assert_eq!(h.sweeper.expire_old_bookings().await.unwrap(), 1);

    h.payments
        .apply_payment_callback(&callback(id, "PAID"), CALLBACK_TOKEN)
        .await
        .unwrap();
    h.tasks.wait_idle().await;

    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Expired);
    assert_eq!(h.store.payments().await[0].payment_status, PaymentStatus::Paid);
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_late_pending_callback_keeps_paid_payment() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    h.payments
        .apply_payment_callback(&callback(id, "PAID"), CALLBACK_TOKEN)
        .await
        .unwrap();
    let mut late = callback(id, "PENDING");
    late.payment_method = None;
    late.paid_at = None;
    h.payments
        .apply_payment_callback(&late, CALLBACK_TOKEN)
        .await
        .unwrap();
    h.tasks.wait_idle().await;

    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Confirmed);
    let payment = &h.store.payments().await[0];
    assert_eq!(payment.payment_status, PaymentStatus::Paid);
    assert_eq!(payment.payment_method, "BANK_TRANSFER");
    assert_eq!(
        payment.paid_at,
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap())
    );
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_underpaid_callback_still_confirms() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    let mut cb = callback(id, "PAID");
    cb.paid_amount = Some(1_000);
    h.payments
        .apply_payment_callback(&cb, CALLBACK_TOKEN)
        .await
        .unwrap();
    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_callback_for_unknown_booking() {
    let h = Harness::new().await;
    let missing = Uuid::new_v4();
    let mut cb = callback(missing, "PAID");
    cb.id = "inv-404".into();

    let err = h
        .payments
        .apply_payment_callback(&cb, CALLBACK_TOKEN)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::NotFound(format!("payment not found for booking ID: {missing}"))
    );

    cb.external_id = "not-a-uuid".into();
    let err = h
        .payments
        .apply_payment_callback(&cb, CALLBACK_TOKEN)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
    assert!(h.metric(r#"payment_callbacks_total{outcome="rejected"} 2"#));
}

#[tokio::test]
async fn test_callback_falls_back_to_latest_payment_of_booking() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;
    let mut cb = callback(id, "PAID");
    cb.id = String::new();

    h.payments
        .apply_payment_callback(&cb, CALLBACK_TOKEN)
        .await
        .unwrap();
    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_sweeper_expires_only_overdue_pending_bookings() {
    let h = Harness::new().await;
    let overdue = pending_booking(&h).await;

    h.clock.advance(TimeDelta::minutes(20));
    let fresh = h
        .bookings
        .create_booking(&h.request("14:00", 60), &user())
        .await
        .unwrap();

    h.clock.advance(TimeDelta::minutes(11));
    assert_eq!(h.sweeper.expire_old_bookings().await.unwrap(), 1);
    assert_eq!(h.sweeper.expire_old_bookings().await.unwrap(), 0);

    let status = |id: Uuid| {
        let store = h.store.clone();
        async move {
            store
                .bookings()
                .await
                .into_iter()
                .find(|b| b.id == id)
                .unwrap()
                .status
        }
    };
    assert_eq!(status(overdue).await, BookingStatus::Expired);
    assert_eq!(
        status(fresh.order_id.parse().unwrap()).await,
        BookingStatus::Pending
    );
    assert!(h.metric("bookings_expired_total 1"));

    // The expired slot can be booked again.
    h.bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sweep_drops_cached_booking() {
    let h = Harness::new().await;
    let id = pending_booking(&h).await;

    // Fill the single-booking cache entry.
    let cached = h.bookings.get_booking_by_id(id).await.unwrap();
    assert_eq!(cached.status, BookingStatus::Pending);
    h.tasks.wait_idle().await;

    h.clock.advance(TimeDelta::minutes(31));
    assert_eq!(h.sweeper.expire_old_bookings().await.unwrap(), 1);
    h.tasks.wait_idle().await;

    let served = h.bookings.get_booking_by_id(id).await.unwrap();
    assert_eq!(served.status, BookingStatus::Expired);
}

#[tokio::test]
async fn test_sweeper_run_stops_on_shutdown() {
    let h = Arc::new(Harness::new().await);
    pending_booking(&h).await;
    h.clock.advance(TimeDelta::hours(1));

    let shutdown = Arc::new(Notify::new());
    let runner = {
        let h = h.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { h.sweeper.run(shutdown).await })
    };

    // The first tick fires immediately.
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.store.bookings().await[0].status != BookingStatus::Expired {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    shutdown.notify_waiters();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
}
