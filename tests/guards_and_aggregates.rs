mod common;

use channel_sync::model::{CalendarEvent, EventStatus, Origin};
use channel_sync::{GuardViolation, Session, SyncEngine};
use chrono::{TimeZone, Utc};
use common::*;

#[tokio::test]
async fn zero_length_event_is_rejected_and_nothing_is_written() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    let instant = Utc.with_ymd_and_hms(2026, 1, 10, 14, 0, 0).unwrap();
    session
        .events
        .insert(CalendarEvent::new(suite, instant, instant, EventStatus::Confirmed));

    let err = engine.commit(&mut session).await.unwrap_err();
    assert!(matches!(err.violation(), Some(GuardViolation::InvalidDuration { .. })));
    assert!(err.to_string().contains("2026-01-10 14:00:00 UTC"));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM resources").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM calendar_events").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs").await, 0);
}

#[tokio::test]
async fn only_the_channel_cancels_channel_bookings() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::inbound(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    let event = stay(&mut session, suite, None);
    session.events.get_mut(event).origin = Origin::Channel;
    engine.commit(&mut session).await.unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let mut session = Session::new(at(5));
    let event = load_event(&pool, &mut session, event_id).await;
    session.events.get_mut(event).status = EventStatus::Cancelled;
    let err = engine.commit(&mut session).await.unwrap_err();
    assert!(matches!(err.violation(), Some(GuardViolation::LockedField { .. })));

    let mut session = Session::new(at(6));
    let event = load_event(&pool, &mut session, event_id).await;
    session.remove_event(event);
    let err = engine.commit(&mut session).await.unwrap_err();
    assert!(matches!(err.violation(), Some(GuardViolation::UnsafeDelete { .. })));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM calendar_events").await, 1);

    let mut session = Session::inbound(at(10));
    let event = load_event(&pool, &mut session, event_id).await;
    session.events.get_mut(event).status = EventStatus::Cancelled;
    engine.commit(&mut session).await.unwrap();
    let status: String = sqlx::query_scalar("SELECT status FROM calendar_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "cancelled");
}

#[tokio::test]
async fn reservation_totals_follow_their_events() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    let first = stay(&mut session, suite, Some("Grace Hopper"));
    let reservation = session.events.get(first).reservation.unwrap();
    session.events.get_mut(first).paid_amount = 36000;
    let second = stay(&mut session, suite, None);
    {
        let extra = session.events.get_mut(second);
        extra.reservation = Some(reservation);
        extra.price_total = 14000;
        extra.adults = 1;
    }

    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.recalculated, 1);
    assert!(engine.recalculator().pending().is_empty());

    let totals: (i64, i64, i64, i64, String) = sqlx::query_as(
        "SELECT total_price, total_paid, guest_count, event_count, payment_status FROM reservations",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(totals, (50000, 36000, 3, 2, "partial".to_string()));

    let second_id = count(&pool, "SELECT id FROM calendar_events WHERE price_total = 14000").await;
    let mut session = Session::new(at(5));
    let second = load_event(&pool, &mut session, second_id).await;
    session.events.get_mut(second).status = EventStatus::Cancelled;
    engine.commit(&mut session).await.unwrap();

    let totals: (i64, i64, i64, i64, String) = sqlx::query_as(
        "SELECT total_price, total_paid, guest_count, event_count, payment_status FROM reservations",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(totals, (36000, 36000, 2, 1, "paid".to_string()));
}
