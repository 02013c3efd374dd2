mod common;

use channel_sync::links;
use channel_sync::model::{Origin, Reservation};
use channel_sync::outbox::{capture_booking_changes, BookingStats};
use channel_sync::{capture_changes, Session, SyncEngine};
use common::*;

#[tokio::test]
async fn new_booking_gets_a_link_and_a_push_per_mapping() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, Some(12000));
    mapping(&mut session, suite, "R-1", true);
    mapping(&mut session, suite, "R-2", false);
    stay(&mut session, suite, Some("Grace Hopper"));

    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.links.created, 2);
    assert_eq!(report.bookings.created, 2);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 2);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE intent = 'upsert' AND status = 'pending'").await,
        2
    );
    let root_room: String = sqlx::query_scalar(
        "SELECT m.external_room_id FROM sync_links l JOIN external_mappings m ON m.id = l.mapping_id \
         WHERE l.origin_link_id IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(root_room, "R-1");
    let title: String = sqlx::query_scalar("SELECT title FROM calendar_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(title, "Grace Hopper · 2p");
}

#[tokio::test]
async fn edits_before_dispatch_merge_into_the_open_push() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    mapping(&mut session, suite, "R-2", false);
    stay(&mut session, suite, Some("Grace Hopper"));
    engine.commit(&mut session).await.unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let mut session = Session::new(at(5));
    let event = load_event(&pool, &mut session, event_id).await;
    session.events.get_mut(event).adults = 3;
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings.created, 0);
    assert_eq!(report.bookings.merged, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs").await, 2);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE json_extract(payload, '$.adults') = 3").await,
        2
    );

    // Nothing changed: nothing is queued.
    let mut session = Session::new(at(10));
    load_event(&pool, &mut session, event_id).await;
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings, Default::default());
    assert_eq!(report.links, Default::default());
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs").await, 2);
}

#[tokio::test]
async fn deleting_an_unpushed_booking_cancels_its_creates() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    mapping(&mut session, suite, "R-2", false);
    stay(&mut session, suite, Some("Grace Hopper"));
    engine.commit(&mut session).await.unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let mut session = Session::new(at(5));
    let event = load_event(&pool, &mut session, event_id).await;
    session.remove_event(event);
    let report = engine.commit(&mut session).await.unwrap();

    assert_eq!(report.bookings.cancelled, 2);
    assert_eq!(report.bookings.created, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM calendar_events").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE intent = 'delete'").await, 0);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE status = 'cancelled' AND link_id IS NULL").await,
        2
    );
}

#[tokio::test]
async fn deactivating_the_root_mapping_reroots_the_event() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    mapping(&mut session, suite, "R-2", false);
    stay(&mut session, suite, None);
    engine.commit(&mut session).await.unwrap();
    let first = count(&pool, "SELECT id FROM external_mappings WHERE external_room_id = 'R-1'").await;

    let mut session = Session::new(at(5));
    let retired = load_mapping(&pool, &mut session, first).await;
    session.mappings.get_mut(retired).active = false;
    let report = engine.commit(&mut session).await.unwrap();

    assert_eq!(report.links.removed, 1);
    assert_eq!(report.links.rerooted, 1);
    assert_eq!(report.bookings.cancelled, 1);

    let remaining: (String, Option<i64>) = sqlx::query_as(
        "SELECT m.external_room_id, l.origin_link_id FROM sync_links l \
         JOIN external_mappings m ON m.id = l.mapping_id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining, ("R-2".to_string(), None));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE status = 'pending'").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE status = 'cancelled'").await, 1);
}

#[tokio::test]
async fn cosmetic_edits_of_locked_channel_reservations_stay_local() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    let event = stay(&mut session, suite, None);
    let mut imported = Reservation::new(Origin::Channel, "Ada Byron");
    imported.data_locked = true;
    let reservation = session.reservations.insert(imported);
    session.events.get_mut(event).reservation = Some(reservation);
    engine.commit(&mut session).await.unwrap();
    sqlx::query("UPDATE push_jobs SET status = 'success'")
        .execute(&pool)
        .await
        .unwrap();
    let event_id = count(&pool, "SELECT id FROM calendar_events").await;

    let mut session = Session::new(at(5));
    let event = load_event(&pool, &mut session, event_id).await;
    let reservation = session.events.get(event).reservation.unwrap();
    session.reservations.get_mut(reservation).guest_email = Some("ada@example.org".into());
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings.created, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM push_jobs").await, 1);

    let mut session = Session::new(at(10));
    let event = load_event(&pool, &mut session, event_id).await;
    let reservation = session.events.get(event).reservation.unwrap();
    session.reservations.get_mut(reservation).guest_name = "Ada Lovelace".into();
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.bookings.created, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM push_jobs WHERE json_extract(payload, '$.guest_name') = 'Ada Lovelace'").await,
        1
    );
}

#[tokio::test]
async fn new_mapping_links_bookings_already_committed() {
    let pool = setup_pool().await;
    let engine = SyncEngine::new(pool.clone(), example_config().sync);

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    stay(&mut session, suite, None);
    engine.commit(&mut session).await.unwrap();
    let resource_id = count(&pool, "SELECT id FROM resources").await;

    let mut session = Session::new(at(5));
    let mut tx = pool.begin().await.unwrap();
    let suite = session.load_resource(&mut tx, resource_id).await.unwrap();
    tx.commit().await.unwrap();
    mapping(&mut session, suite, "R-2", false);
    let report = engine.commit(&mut session).await.unwrap();

    assert_eq!(report.links.created, 1);
    assert_eq!(report.bookings.created, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 2);
    let second = count(&pool, "SELECT id FROM external_mappings WHERE external_room_id = 'R-2'").await;

    let mut session = Session::new(at(10));
    let retired = load_mapping(&pool, &mut session, second).await;
    session.mappings.get_mut(retired).active = false;
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.links.removed, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 1);

    let mut session = Session::new(at(15));
    let revived = load_mapping(&pool, &mut session, second).await;
    session.mappings.get_mut(revived).active = true;
    let report = engine.commit(&mut session).await.unwrap();
    assert_eq!(report.links.created, 1);
    assert_eq!(report.bookings.created, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_links").await, 2);
    assert_eq!(
        count(&pool, &format!("SELECT COUNT(*) FROM sync_links WHERE mapping_id = {}", second)).await,
        1
    );
}

#[tokio::test]
async fn booking_capture_is_idempotent_within_one_transaction() {
    let pool = setup_pool().await;
    let sync = example_config().sync;

    let mut session = Session::new(t0());
    let suite = room(&mut session, None);
    mapping(&mut session, suite, "R-1", true);
    stay(&mut session, suite, Some("Ada Lovelace"));
    let changes = capture_changes(&session);
    let events = links::touched_events(&session, &changes);
    links::reconcile_all(&mut session, events);
    let changes = capture_changes(&session);

    let mut tx = pool.begin().await.unwrap();
    let first = capture_booking_changes(&mut session, &mut tx, &changes, &sync).await.unwrap();
    let second = capture_booking_changes(&mut session, &mut tx, &changes, &sync).await.unwrap();
    assert_eq!(first.created, 1);
    assert_eq!(
        second,
        BookingStats {
            merged: 1,
            ..Default::default()
        }
    );
    assert_eq!(session.push_jobs.live().count(), 1);

    session.flush(&mut tx).await.unwrap();
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM push_jobs")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    tx.rollback().await.unwrap();
}
