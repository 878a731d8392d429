mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::TimeDelta;
use common::{Delays, Harness, PRICE_PER_HOUR, actor, start, user};
use model::{BookingStatus, CanceledBy, PAYMENT_METHOD_CASH, Pagination, PaymentStatus, Role};
use service::{BookingService, ServiceError};
use uuid::Uuid;

#[tokio::test]
async fn test_create_booking_issues_invoice() {
    let h = Harness::new().await;
    let player = user();

    let invoice = h
        .bookings
        .create_booking(&h.request("10:00", 90), &player)
        .await
        .unwrap();
    assert_eq!(invoice.id, "inv-1");
    assert_eq!(invoice.amount, 150_000);
    assert_eq!(invoice.status, "PENDING");
    assert_eq!(
        invoice.payment_url.as_deref(),
        Some("https://pay.example.com/inv-1")
    );

    let booking_id: Uuid = invoice.order_id.parse().unwrap();
    let booking = h.bookings.get_booking_by_id(booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.user_id, player.user_id.to_string());
    assert_eq!(booking.start_time, "10:00");
    assert_eq!(booking.end_time, "11:30");
    assert_eq!(booking.total_price, 150_000);
    assert_eq!(booking.expires_at, start() + TimeDelta::minutes(30));

    let orders = h.gateway.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].external_id, invoice.order_id);
    assert_eq!(orders[0].payer_email, "player@example.com");

    let payments = h.store.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].booking_id, booking_id);
    assert_eq!(payments[0].transaction_id, "inv-1");
    assert_eq!(payments[0].payment_status, PaymentStatus::Pending);

    assert!(h.metric(r#"bookings_created_total{settlement="gateway"} 1"#));
}

#[tokio::test]
async fn test_overlap_is_rejected_but_touching_is_allowed() {
    let h = Harness::new().await;
    h.bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap();

    let err = h
        .bookings
        .create_booking(&h.request("10:30", 60), &user())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Conflict("there are already bookings for this field at this time".into())
    );

    h.bookings
        .create_booking(&h.request("11:00", 60), &user())
        .await
        .unwrap();
    h.bookings
        .create_booking(&h.request("09:00", 60), &user())
        .await
        .unwrap();

    assert_eq!(h.store.bookings().await.len(), 3);
    assert!(h.metric("booking_conflicts_total 1"));
}

#[tokio::test]
async fn test_concurrent_creations_admit_exactly_one() {
    let h = Harness::new().await;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let bookings = h.bookings.clone();
        let req = h.request("18:00", 120);
        handles.push(tokio::spawn(async move {
            bookings.create_booking(&req, &user()).await
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(ServiceError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn test_invalid_requests() {
    let h = Harness::new().await;
    let player = user();

    let mut bad_date = h.request("10:00", 60);
    bad_date.date = "02-01-2024".into();
    let err = h.bookings.create_booking(&bad_date, &player).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    let err = h
        .bookings
        .create_booking(&h.request("25:00", 60), &player)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    let err = h
        .bookings
        .create_booking(&h.request("10:00", 0), &player)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    // Would end past midnight.
    let err = h
        .bookings
        .create_booking(&h.request("23:00", 120), &player)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    let mut unknown_field = h.request("10:00", 60);
    unknown_field.field_id = Uuid::new_v4();
    let err = h
        .bookings
        .create_booking(&unknown_field, &player)
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::NotFound("field not found".into()));

    assert!(h.store.bookings().await.is_empty());
    assert!(h.gateway.orders().is_empty());
}

#[tokio::test]
async fn test_past_start_is_rejected_in_app_timezone() {
    let h = Harness::new().await;
    let mut req = h.request("06:59", 60);
    req.date = "2024-01-01".into();

    let err = h.bookings.create_booking(&req, &user()).await.unwrap_err();
    assert_eq!(
        err,
        ServiceError::BadRequest("booking time cannot be in the past".into())
    );

    // 07:01 local is after 00:00 UTC.
    req.start_time = "07:01".into();
    h.bookings.create_booking(&req, &user()).await.unwrap();
}

#[tokio::test]
async fn test_cash_booking_by_staff_is_paid_without_invoice() {
    let h = Harness::new().await;
    let mut req = h.request("08:00", 60);
    req.cash = true;

    let receipt = h
        .bookings
        .create_booking(&req, &actor(Role::Staff))
        .await
        .unwrap();
    assert!(receipt.id.starts_with("CASH-"));
    assert_eq!(receipt.status, "PAID");
    assert_eq!(receipt.amount, PRICE_PER_HOUR);
    assert!(receipt.payment_url.is_none());
    assert!(h.gateway.orders().is_empty());

    let bookings = h.store.bookings().await;
    assert_eq!(bookings[0].status, BookingStatus::Paid);
    let payments = h.store.payments().await;
    assert_eq!(payments[0].payment_method, PAYMENT_METHOD_CASH);
    assert_eq!(payments[0].payment_status, PaymentStatus::Paid);
    assert_eq!(payments[0].paid_at, Some(start()));
    assert!(h.metric(r#"bookings_created_total{settlement="cash"} 1"#));
}

#[tokio::test]
async fn test_cash_booking_by_user_is_forbidden() {
    let h = Harness::new().await;
    let mut req = h.request("08:00", 60);
    req.cash = true;

    let err = h.bookings.create_booking(&req, &user()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));
    assert!(h.store.bookings().await.is_empty());
}

#[tokio::test]
async fn test_gateway_failure_releases_the_slot() {
    let h = Harness::new().await;
    h.gateway.fail.store(true, Ordering::SeqCst);

    let err = h
        .bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Internal(_)));

    let bookings = h.store.bookings().await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].status, BookingStatus::Cancelled);
    assert_eq!(bookings[0].canceled_by, Some(CanceledBy::System));
    assert!(h.store.payments().await.is_empty());

    h.gateway.fail.store(false, Ordering::SeqCst);
    h.bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_amount_below_gateway_minimum_is_rejected_and_released() {
    let h = Harness::with_price(5_000).await;

    let err = h
        .bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap_err();
    match err {
        ServiceError::BadRequest(msg) => assert!(msg.starts_with("validation error")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.gateway.orders().is_empty());
    assert_eq!(h.store.bookings().await[0].status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn test_user_cancel_rules() {
    let h = Harness::new().await;
    let owner = user();
    let invoice = h
        .bookings
        .create_booking(&h.request("10:00", 60), &owner)
        .await
        .unwrap();
    let id: Uuid = invoice.order_id.parse().unwrap();

    let err = h
        .bookings
        .cancel_user_booking(id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    h.bookings.cancel_user_booking(id, owner.user_id).await.unwrap();
    let cancelled = h.store.bookings().await.remove(0);
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.canceled_by, Some(CanceledBy::User));
    assert_eq!(cancelled.canceled_at, Some(start()));

    let err = h
        .bookings
        .cancel_user_booking(id, owner.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // The slot is free again.
    h.bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_user_cannot_cancel_paid_booking_but_staff_can() {
    let h = Harness::new().await;
    let staff = actor(Role::Staff);
    let mut req = h.request("10:00", 60);
    req.cash = true;
    let receipt = h.bookings.create_booking(&req, &staff).await.unwrap();
    let id: Uuid = receipt.order_id.parse().unwrap();

    let err = h
        .bookings
        .cancel_user_booking(id, staff.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let err = h.bookings.cancel_booking(id, &user()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    h.bookings
        .cancel_booking(id, &actor(Role::Admin))
        .await
        .unwrap();
    let booking = h.store.bookings().await.remove(0);
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.canceled_by, Some(CanceledBy::Admin));

    let err = h
        .bookings
        .cancel_booking(Uuid::new_v4(), &staff)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_user_listing_pages_and_filters() {
    let h = Harness::new().await;
    let owner = user();
    for start_time in ["08:00", "10:00", "12:00"] {
        h.bookings
            .create_booking(&h.request(start_time, 60), &owner)
            .await
            .unwrap();
    }
    h.bookings
        .create_booking(&h.request("14:00", 60), &user())
        .await
        .unwrap();

    let page = Pagination {
        page: 1,
        limit: 2,
        filter: String::new(),
    };
    let listed = h.bookings.get_user_bookings(owner.user_id, &page).await.unwrap();
    assert_eq!(listed.bookings.len(), 2);
    assert_eq!(listed.total_items, 3);
    assert_eq!(listed.total_pages, 2);
    assert_eq!(listed.bookings[0].start_time, "12:00");

    let confirmed = Pagination {
        filter: "confirmed".into(),
        ..Pagination::default()
    };
    let listed = h
        .bookings
        .get_user_bookings(owner.user_id, &confirmed)
        .await
        .unwrap();
    assert!(listed.bookings.is_empty());
    assert_eq!(listed.total_items, 0);

    let bogus = Pagination {
        filter: "DONE".into(),
        ..Pagination::default()
    };
    let err = h
        .bookings
        .get_user_bookings(owner.user_id, &bogus)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
}

#[tokio::test]
async fn test_writes_invalidate_cached_reads() {
    let h = Harness::new().await;
    let owner = user();
    let page = Pagination::default();

    let before = h.bookings.get_user_bookings(owner.user_id, &page).await.unwrap();
    let slots = h
        .bookings
        .get_booked_slots(h.field_id, common::BOOKING_DATE)
        .await
        .unwrap();
    assert_eq!(before.total_items, 0);
    assert_eq!(slots.total_items, 0);
    h.tasks.wait_idle().await;
    assert!(!h.cache.is_empty().await);

    let invoice = h
        .bookings
        .create_booking(&h.request("10:00", 60), &owner)
        .await
        .unwrap();
    h.tasks.wait_idle().await;

    let after = h.bookings.get_user_bookings(owner.user_id, &page).await.unwrap();
    assert_eq!(after.total_items, 1);
    let slots = h
        .bookings
        .get_booked_slots(h.field_id, common::BOOKING_DATE)
        .await
        .unwrap();
    assert_eq!(slots.total_items, 1);
    assert_eq!(slots.booked_slots[0].start_time, "10:00");
    assert_eq!(slots.booked_slots[0].end_time, "11:00");

    let id: Uuid = invoice.order_id.parse().unwrap();
    let cached = h.bookings.get_booking_by_id(id).await.unwrap();
    assert_eq!(cached.status, BookingStatus::Pending);
    h.tasks.wait_idle().await;

    h.bookings.cancel_user_booking(id, owner.user_id).await.unwrap();
    h.tasks.wait_idle().await;

    let fresh = h.bookings.get_booking_by_id(id).await.unwrap();
    assert_eq!(fresh.status, BookingStatus::Cancelled);
    let slots = h
        .bookings
        .get_booked_slots(h.field_id, common::BOOKING_DATE)
        .await
        .unwrap();
    assert_eq!(slots.total_items, 0);
}

#[tokio::test]
async fn test_booked_slots_rejects_bad_date() {
    let h = Harness::new().await;
    let err = h
        .bookings
        .get_booked_slots(h.field_id, "tomorrow")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
}

#[tokio::test]
async fn test_unknown_booking_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .bookings
        .get_booking_by_id(Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::NotFound("booking not found".into()));
}

#[tokio::test(start_paused = true)]
async fn test_slow_transaction_times_out_and_leaves_nothing() {
    let h = Harness::slow(
        Delays {
            field_price: Duration::from_secs(3),
            ..Delays::default()
        },
        Duration::from_secs(1),
    )
    .await;

    let err = h
        .bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Internal("booking transaction timed out".into())
    );
    assert!(h.store.bookings().await.is_empty());
    assert!(h.store.payments().await.is_empty());
    assert!(h.gateway.orders().is_empty());
    assert!(!h.metric(r#"bookings_created_total{settlement="gateway"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn test_slow_commit_is_not_cut_by_the_deadline() {
    let h = Harness::slow(
        Delays {
            commit: Duration::from_secs(3),
            ..Delays::default()
        },
        Duration::from_secs(1),
    )
    .await;

    let invoice = h
        .bookings
        .create_booking(&h.request("10:00", 60), &user())
        .await
        .unwrap();

    let bookings = h.store.bookings().await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id.to_string(), invoice.order_id);
    assert_eq!(h.store.payments().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_dropped_during_commit_still_settles() {
    let h = Harness::slow(
        Delays {
            commit: Duration::from_secs(3),
            ..Delays::default()
        },
        Duration::from_secs(1),
    )
    .await;

    let bookings = h.bookings.clone();
    let req = h.request("10:00", 60);
    let player = user();
    let caller = tokio::spawn(async move { bookings.create_booking(&req, &player).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.tasks.wait_idle().await;

    let rows = h.store.bookings().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BookingStatus::Pending);
    assert_eq!(h.gateway.orders().len(), 1);
    assert_eq!(h.store.payments().await[0].booking_id, rows[0].id);
    assert!(h.metric(r#"bookings_created_total{settlement="gateway"} 1"#));
}
