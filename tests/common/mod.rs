#![allow(dead_code)]

use channel_sync::config::{self, Config};
use channel_sync::db::{self, Pool};
use channel_sync::model::{
    CalendarEvent, EventStatus, ExternalMapping, Origin, PriceRule, Reservation, Resource,
};
use channel_sync::{Handle, Session};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;

/// One connection, kept for the whole test: each `sqlite::memory:`
/// connection is its own database.
pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn example_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap()
}

pub fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

pub fn room(session: &mut Session, base_price: Option<i64>) -> Handle<Resource> {
    session.resources.insert(Resource {
        name: "Garden Suite".into(),
        base_price,
        base_min_stay: 1,
        currency: "EUR".into(),
    })
}

pub fn mapping(
    session: &mut Session,
    resource: Handle<Resource>,
    room_id: &str,
    principal: bool,
) -> Handle<ExternalMapping> {
    session.mappings.insert(ExternalMapping {
        resource,
        external_room_id: room_id.into(),
        external_property_id: "P-100".into(),
        active: true,
        principal,
    })
}

pub fn stay(session: &mut Session, resource: Handle<Resource>, guest: Option<&str>) -> Handle<CalendarEvent> {
    let start = Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap();
    let mut event = CalendarEvent::new(resource, start, start + Duration::days(3), EventStatus::Confirmed);
    event.adults = 2;
    event.price_total = 36000;
    if let Some(guest) = guest {
        event.reservation = Some(session.reservations.insert(Reservation::new(Origin::Local, guest)));
    }
    session.events.insert(event)
}

pub async fn count(pool: &Pool, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await.unwrap()
}

pub async fn load_event(pool: &Pool, session: &mut Session, id: i64) -> Handle<CalendarEvent> {
    let mut tx = pool.begin().await.unwrap();
    let handle = session.load_event(&mut tx, id).await.unwrap();
    tx.commit().await.unwrap();
    handle
}

pub async fn load_mapping(pool: &Pool, session: &mut Session, id: i64) -> Handle<ExternalMapping> {
    let mut tx = pool.begin().await.unwrap();
    let handle = session.load_mapping(&mut tx, id).await.unwrap();
    tx.commit().await.unwrap();
    handle
}

pub async fn load_price_rule(pool: &Pool, session: &mut Session, id: i64) -> Handle<PriceRule> {
    let mut tx = pool.begin().await.unwrap();
    let handle = session.load_price_rule(&mut tx, id).await.unwrap();
    tx.commit().await.unwrap();
    handle
}
