//! Row models returned by and written through repositories.
//!
//! Rows carry plain ids and text-encoded enums; translating them to session
//! entities (and back) lives in `crate::session::{load, flush}`.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ResourceRow {
    pub id: i64,
    pub name: String,
    pub base_price: Option<i64>,
    pub base_min_stay: i32,
    pub currency: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct MappingRow {
    pub id: i64,
    pub resource_id: i64,
    pub external_room_id: String,
    pub external_property_id: String,
    pub active: bool,
    pub principal: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReservationRow {
    pub id: i64,
    pub origin: String,
    pub data_locked: bool,
    pub guest_name: String,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
    pub comment: Option<String>,
    pub internal_note: Option<String>,
    pub total_price: i64,
    pub total_paid: i64,
    pub guest_count: i32,
    pub event_count: i32,
    pub payment_status: String,
    pub arrival_at: Option<DateTime<Utc>>,
    pub departure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: i64,
    pub resource_id: i64,
    pub reservation_id: Option<i64>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: String,
    pub payment_status: String,
    pub origin: String,
    pub adults: i32,
    pub children: i32,
    pub price_total: i64,
    pub paid_amount: i64,
    pub title: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct LinkRow {
    pub id: i64,
    pub event_id: i64,
    pub mapping_id: Option<i64>,
    pub external_booking_id: Option<String>,
    pub status: String,
    pub last_seen_at: DateTime<Utc>,
    pub origin_link_id: Option<i64>,
}

/// Claim/retry columns shared by the three outbox tables.
#[derive(Debug, Clone, FromRow)]
pub struct DispatchRow {
    pub status: String,
    pub retry_count: i32,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_http_code: Option<i32>,
    pub last_request_raw: Option<String>,
    pub last_response_raw: Option<String>,
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PushJobRow {
    pub id: i64,
    pub link_id: Option<i64>,
    pub endpoint: String,
    pub intent: String,
    #[sqlx(flatten)]
    pub dispatch: DispatchRow,
    pub dedupe_key: String,
    pub external_id_at_creation: Option<String>,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PriceRuleRow {
    pub id: i64,
    pub resource_id: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
    pub important: bool,
    pub weight: i32,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct RateJobRow {
    pub id: i64,
    pub resource_id: i64,
    pub endpoint: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
    pub price_rule_id: Option<i64>,
    #[sqlx(flatten)]
    pub dispatch: DispatchRow,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeliveryRow {
    pub id: i64,
    pub job_id: i64,
    pub mapping_id: i64,
    #[sqlx(flatten)]
    pub dispatch: DispatchRow,
    pub effective_at: DateTime<Utc>,
}

/// Aggregates derived from the non-cancelled events of one reservation.
#[derive(Debug, Clone, FromRow)]
pub struct ReservationTotals {
    pub event_count: i64,
    pub total_price: i64,
    pub total_paid: i64,
    pub guest_count: i64,
    pub arrival_at: Option<DateTime<Utc>>,
    pub departure_at: Option<DateTime<Utc>>,
}
