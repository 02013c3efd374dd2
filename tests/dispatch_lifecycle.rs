mod common;

use channel_sync::db::dispatch::{self, DispatchOutcome, OutboxTable, RetryPolicy};
use channel_sync::db::Pool;
use channel_sync::model::EventStatus;
use channel_sync::{GuardViolation, Session, SyncEngine};
use chrono::{DateTime, Utc};
use common::*;

async fn claim(pool: &Pool, worker: &str, now: DateTime<Utc>) -> Option<i64> {
    dispatch::claim_next(pool, OutboxTable::PushJobs, worker, now).await.unwrap()
}

async fn report_back(
    pool: &Pool,
    job: i64,
    worker: &str,
    outcome: &DispatchOutcome,
    policy: RetryPolicy,
    now: DateTime<Utc>,
) -> bool {
    dispatch::complete(pool, OutboxTable::PushJobs, job, worker, outcome, policy, now)
        .await
        .unwrap()
}

fn success() -> DispatchOutcome {
    DispatchOutcome {
        http_code: Some(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn local_edit_takes_back_a_claimed_push() {
    let pool = setup_pool().await;
    let config = example_config();
    let engine = SyncEngine::new(pool.clone(), config.sync.clone());

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    stay(&mut session, suite, Some("Grace Hopper"));
    engine.commit(&mut session).await.unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let worker = dispatch::new_worker_id();
    let job = claim(&pool, &worker, at(1)).await.unwrap();
    assert_eq!(claim(&pool, "other", at(1)).await, None);

    let mut session = Session::new(at(2));
    let event = load_event(&pool, &mut session, event_id).await;
    session.events.get_mut(event).children = 1;
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings.merged, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs").await, 1);

    // The worker lost its claim; its result is dropped.
    let written = report_back(&pool, job, &worker, &success(), config.retry_policy(), at(3)).await;
    assert!(!written);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE status = 'pending'").await, 1);

    let again = claim(&pool, &worker, at(3)).await;
    assert_eq!(again, Some(job));
}

#[tokio::test]
async fn failed_pushes_back_off_then_give_up() {
    let pool = setup_pool().await;
    let mut config = example_config();
    config.app.max_attempts = 2;
    let engine = SyncEngine::new(pool.clone(), config.sync.clone());

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    stay(&mut session, suite, None);
    engine.commit(&mut session).await.unwrap();

    let failure = DispatchOutcome {
        http_code: Some(502),
        error: Some("bad gateway".into()),
        ..Default::default()
    };
    let job = claim(&pool, "w", at(1)).await.unwrap();
    assert!(report_back(&pool, job, "w", &failure, config.retry_policy(), at(1)).await);
    // Backing off: not due yet.
    assert_eq!(claim(&pool, "w", at(1)).await, None);

    let job = claim(&pool, "w", at(10)).await.unwrap();
    assert!(report_back(&pool, job, "w", &failure, config.retry_policy(), at(10)).await);
    let (status, retries, reason): (String, i32, Option<String>) =
        sqlx::query_as("SELECT status, retry_count, failed_reason FROM push_jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(retries, 2);
    assert_eq!(reason.as_deref(), Some("bad gateway"));
}

#[tokio::test]
async fn pushed_booking_is_deleted_only_after_cancel_reaches_the_channel() {
    let pool = setup_pool().await;
    let config = example_config();
    let engine = SyncEngine::new(pool.clone(), config.sync.clone());

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    stay(&mut session, suite, None);
    engine.commit(&mut session).await.unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let job = claim(&pool, "w", at(1)).await.unwrap();
    assert!(dispatch::record_external_booking_id(&pool, job, "w", "BK-1").await.unwrap());
    assert!(report_back(&pool, job, "w", &success(), config.retry_policy(), at(1)).await);
    let remote: Option<String> = sqlx::query_scalar("SELECT external_booking_id FROM sync_links")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remote.as_deref(), Some("BK-1"));

    // Still booked remotely.
    let mut session = Session::new(at(2));
    let event = load_event(&pool, &mut session, event_id).await;
    session.remove_event(event);
    let err = engine.commit(&mut session).await.unwrap_err();
    assert!(matches!(err.violation(), Some(GuardViolation::UnsafeDelete { .. })));

    let mut session = Session::new(at(3));
    let event = load_event(&pool, &mut session, event_id).await;
    session.events.get_mut(event).status = EventStatus::Cancelled;
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings.created, 1);

    // Cancellation not sent yet.
    let mut session = Session::new(at(4));
    let event = load_event(&pool, &mut session, event_id).await;
    session.remove_event(event);
    let err = engine.commit(&mut session).await.unwrap_err();
    assert!(err.to_string().contains("still being sent"));

    let job = claim(&pool, "w", at(5)).await.unwrap();
    assert!(report_back(&pool, job, "w", &success(), config.retry_policy(), at(5)).await);

    let mut session = Session::new(at(6));
    let event = load_event(&pool, &mut session, event_id).await;
    session.remove_event(event);
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings.created, 1);

    let (intent, remote, status): (String, Option<String>, String) = sqlx::query_as(
        "SELECT intent, external_id_at_creation, status FROM push_jobs ORDER BY id DESC LIMIT 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(intent, "delete");
    assert_eq!(remote.as_deref(), Some("BK-1"));
    assert_eq!(status, "pending");
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM calendar_events").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 0);
}

#[tokio::test]
async fn cancel_and_delete_in_one_commit_keeps_a_pushed_booking() {
    let pool = setup_pool().await;
    let config = example_config();
    let engine = SyncEngine::new(pool.clone(), config.sync.clone());

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    stay(&mut session, suite, None);
    engine.commit(&mut session).await.unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let job = claim(&pool, "w", at(1)).await.unwrap();
    assert!(dispatch::record_external_booking_id(&pool, job, "w", "BK-1").await.unwrap());
    assert!(report_back(&pool, job, "w", &success(), config.retry_policy(), at(1)).await);

    let mut session = Session::new(at(2));
    let event = load_event(&pool, &mut session, event_id).await;
    session.events.get_mut(event).status = EventStatus::Cancelled;
    session.remove_event(event);
    let err = engine.commit(&mut session).await.unwrap_err();
    assert!(matches!(err.violation(), Some(GuardViolation::UnsafeDelete { .. })));
    assert!(err.to_string().contains("cancel it first"));

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM calendar_events").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs").await, 1);
}
