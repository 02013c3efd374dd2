use super::model::{
    DeliveryRow, EventRow, LinkRow, MappingRow, PriceRuleRow, PushJobRow,
    RateJobRow, ReservationRow, ReservationTotals, ResourceRow,
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'c> = Transaction<'c, Sqlite>;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form; create the file on first use.
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ── Reads ─────────────────────────────────────────────────────────

#[instrument(skip_all)]
pub async fn fetch_resource(tx: &mut Tx<'_>, id: i64) -> Result<Option<ResourceRow>> {
    let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn fetch_mappings_for_resource(tx: &mut Tx<'_>, resource_id: i64) -> Result<Vec<MappingRow>> {
    let rows = sqlx::query_as::<_, MappingRow>(
        "SELECT * FROM external_mappings WHERE resource_id = ? ORDER BY id",
    )
    .bind(resource_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn fetch_mapping(tx: &mut Tx<'_>, id: i64) -> Result<Option<MappingRow>> {
    let row = sqlx::query_as::<_, MappingRow>("SELECT * FROM external_mappings WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn fetch_reservation(tx: &mut Tx<'_>, id: i64) -> Result<Option<ReservationRow>> {
    let row = sqlx::query_as::<_, ReservationRow>("SELECT * FROM reservations WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn fetch_event(tx: &mut Tx<'_>, id: i64) -> Result<Option<EventRow>> {
    let row = sqlx::query_as::<_, EventRow>("SELECT * FROM calendar_events WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn fetch_events_for_reservation(tx: &mut Tx<'_>, reservation_id: i64) -> Result<Vec<EventRow>> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM calendar_events WHERE reservation_id = ? ORDER BY id",
    )
    .bind(reservation_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn fetch_links_for_event(tx: &mut Tx<'_>, event_id: i64) -> Result<Vec<LinkRow>> {
    let rows = sqlx::query_as::<_, LinkRow>("SELECT * FROM sync_links WHERE event_id = ? ORDER BY id")
        .bind(event_id)
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows)
}

/// Events that currently hold a link through the given mapping.
#[instrument(skip_all)]
pub async fn fetch_event_ids_linked_to_mapping(tx: &mut Tx<'_>, mapping_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT DISTINCT event_id FROM sync_links WHERE mapping_id = ? ORDER BY event_id",
    )
    .bind(mapping_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn fetch_event_ids_for_resource(tx: &mut Tx<'_>, resource_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM calendar_events WHERE resource_id = ? ORDER BY id",
    )
    .bind(resource_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn fetch_price_rule(tx: &mut Tx<'_>, id: i64) -> Result<Option<PriceRuleRow>> {
    let row = sqlx::query_as::<_, PriceRuleRow>("SELECT * FROM price_rules WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

/// Active rules of a resource intersecting `[start, end)`.
#[instrument(skip_all)]
pub async fn fetch_active_rules_overlapping(
    tx: &mut Tx<'_>,
    resource_id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceRuleRow>> {
    let rows = sqlx::query_as::<_, PriceRuleRow>(
        "SELECT * FROM price_rules \
         WHERE resource_id = ? AND active = 1 AND start_date < ? AND end_date > ? \
         ORDER BY id",
    )
    .bind(resource_id)
    .bind(end)
    .bind(start)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

/// The pending or processing job for a link and intent, if any.
#[instrument(skip_all)]
pub async fn fetch_open_push_job(tx: &mut Tx<'_>, link_id: i64, intent: &str) -> Result<Option<PushJobRow>> {
    let row = sqlx::query_as::<_, PushJobRow>(
        "SELECT * FROM push_jobs \
         WHERE link_id = ? AND intent = ? AND status IN ('pending', 'processing') \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(link_id)
    .bind(intent)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

/// Most recent external booking id recorded on any job of the link.
#[instrument(skip_all)]
pub async fn latest_external_id_for_link(tx: &mut Tx<'_>, link_id: i64) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>(
        "SELECT external_id_at_creation FROM push_jobs \
         WHERE link_id = ? AND external_id_at_creation IS NOT NULL AND external_id_at_creation != '' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(link_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(id)
}

/// Pending rate jobs for the same target and winner whose span overlaps or
/// touches `[start, end)`. `price_rule_id = None` selects base-rate jobs.
#[instrument(skip_all)]
pub async fn fetch_mergeable_rate_jobs(
    tx: &mut Tx<'_>,
    resource_id: i64,
    endpoint: &str,
    price_rule_id: Option<i64>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RateJobRow>> {
    let rows = sqlx::query_as::<_, RateJobRow>(
        "SELECT * FROM rate_queue_jobs \
         WHERE resource_id = ? AND endpoint = ? AND price_rule_id IS ? AND status = 'pending' \
           AND start_date <= ? AND end_date >= ? \
         ORDER BY id",
    )
    .bind(resource_id)
    .bind(endpoint)
    .bind(price_rule_id)
    .bind(end)
    .bind(start)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

/// Pending rate jobs of a target whose span overlaps `[start, end)`, any winner.
#[instrument(skip_all)]
pub async fn fetch_pending_rate_jobs_overlapping(
    tx: &mut Tx<'_>,
    resource_id: i64,
    endpoint: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RateJobRow>> {
    let rows = sqlx::query_as::<_, RateJobRow>(
        "SELECT * FROM rate_queue_jobs \
         WHERE resource_id = ? AND endpoint = ? AND status = 'pending' \
           AND start_date < ? AND end_date > ? \
         ORDER BY id",
    )
    .bind(resource_id)
    .bind(endpoint)
    .bind(end)
    .bind(start)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn fetch_delivery(tx: &mut Tx<'_>, job_id: i64, mapping_id: i64) -> Result<Option<DeliveryRow>> {
    let row = sqlx::query_as::<_, DeliveryRow>(
        "SELECT * FROM rate_deliveries WHERE job_id = ? AND mapping_id = ?",
    )
    .bind(job_id)
    .bind(mapping_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn fetch_deliveries_for_job(tx: &mut Tx<'_>, job_id: i64) -> Result<Vec<DeliveryRow>> {
    let rows = sqlx::query_as::<_, DeliveryRow>(
        "SELECT * FROM rate_deliveries WHERE job_id = ? ORDER BY id",
    )
    .bind(job_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

// ── Writes ────────────────────────────────────────────────────────
//
// `save_*` inserts when `id` is `None` and updates otherwise; both return the
// row id. Column order in the INSERT and UPDATE statements must match.

#[instrument(skip_all)]
pub async fn save_resource(tx: &mut Tx<'_>, id: Option<i64>, row: &ResourceRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO resources (name, base_price, base_min_stay, currency) VALUES (?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE resources SET name = ?, base_price = ?, base_min_stay = ?, currency = ? WHERE id = ? RETURNING id",
    };
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(&row.name)
        .bind(row.base_price)
        .bind(row.base_min_stay)
        .bind(&row.currency);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save resource")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_mapping(tx: &mut Tx<'_>, id: Option<i64>, row: &MappingRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO external_mappings (resource_id, external_room_id, external_property_id, active, principal) \
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE external_mappings SET resource_id = ?, external_room_id = ?, external_property_id = ?, \
                    active = ?, principal = ? WHERE id = ? RETURNING id",
    };
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.resource_id)
        .bind(&row.external_room_id)
        .bind(&row.external_property_id)
        .bind(row.active)
        .bind(row.principal);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save external mapping")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_reservation(tx: &mut Tx<'_>, id: Option<i64>, row: &ReservationRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO reservations (origin, data_locked, guest_name, guest_email, guest_phone, comment, \
                 internal_note, total_price, total_paid, guest_count, event_count, payment_status, arrival_at, departure_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE reservations SET origin = ?, data_locked = ?, guest_name = ?, guest_email = ?, guest_phone = ?, \
                    comment = ?, internal_note = ?, total_price = ?, total_paid = ?, guest_count = ?, event_count = ?, \
                    payment_status = ?, arrival_at = ?, departure_at = ? WHERE id = ? RETURNING id",
    };
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(&row.origin)
        .bind(row.data_locked)
        .bind(&row.guest_name)
        .bind(&row.guest_email)
        .bind(&row.guest_phone)
        .bind(&row.comment)
        .bind(&row.internal_note)
        .bind(row.total_price)
        .bind(row.total_paid)
        .bind(row.guest_count)
        .bind(row.event_count)
        .bind(&row.payment_status)
        .bind(row.arrival_at)
        .bind(row.departure_at);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save reservation")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_event(tx: &mut Tx<'_>, id: Option<i64>, row: &EventRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO calendar_events (resource_id, reservation_id, start_at, end_at, status, payment_status, \
                 origin, adults, children, price_total, paid_amount, title) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE calendar_events SET resource_id = ?, reservation_id = ?, start_at = ?, end_at = ?, status = ?, \
                    payment_status = ?, origin = ?, adults = ?, children = ?, price_total = ?, paid_amount = ?, title = ? \
                    WHERE id = ? RETURNING id",
    };
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.resource_id)
        .bind(row.reservation_id)
        .bind(row.start_at)
        .bind(row.end_at)
        .bind(&row.status)
        .bind(&row.payment_status)
        .bind(&row.origin)
        .bind(row.adults)
        .bind(row.children)
        .bind(row.price_total)
        .bind(row.paid_amount)
        .bind(&row.title);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save calendar event")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_link(tx: &mut Tx<'_>, id: Option<i64>, row: &LinkRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO sync_links (event_id, mapping_id, external_booking_id, status, last_seen_at, origin_link_id) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE sync_links SET event_id = ?, mapping_id = ?, external_booking_id = ?, status = ?, \
                    last_seen_at = ?, origin_link_id = ? WHERE id = ? RETURNING id",
    };
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.event_id)
        .bind(row.mapping_id)
        .bind(&row.external_booking_id)
        .bind(&row.status)
        .bind(row.last_seen_at)
        .bind(row.origin_link_id);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save sync link")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_push_job(tx: &mut Tx<'_>, id: Option<i64>, row: &PushJobRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO push_jobs (link_id, endpoint, intent, status, retry_count, next_run_at, locked_by, locked_at, \
                 last_http_code, last_request_raw, last_response_raw, failed_reason, dedupe_key, external_id_at_creation, \
                 payload, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE push_jobs SET link_id = ?, endpoint = ?, intent = ?, status = ?, retry_count = ?, next_run_at = ?, \
                    locked_by = ?, locked_at = ?, last_http_code = ?, last_request_raw = ?, last_response_raw = ?, \
                    failed_reason = ?, dedupe_key = ?, external_id_at_creation = ?, payload = ?, created_at = ?, \
                    updated_at = ? WHERE id = ? RETURNING id",
    };
    let d = &row.dispatch;
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.link_id)
        .bind(&row.endpoint)
        .bind(&row.intent)
        .bind(&d.status)
        .bind(d.retry_count)
        .bind(d.next_run_at)
        .bind(&d.locked_by)
        .bind(d.locked_at)
        .bind(d.last_http_code)
        .bind(&d.last_request_raw)
        .bind(&d.last_response_raw)
        .bind(&d.failed_reason)
        .bind(&row.dedupe_key)
        .bind(&row.external_id_at_creation)
        .bind(&row.payload)
        .bind(row.created_at)
        .bind(row.updated_at);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save push job")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_price_rule(tx: &mut Tx<'_>, id: Option<i64>, row: &PriceRuleRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO price_rules (resource_id, start_date, end_date, price, min_stay, currency, important, weight, active) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE price_rules SET resource_id = ?, start_date = ?, end_date = ?, price = ?, min_stay = ?, \
                    currency = ?, important = ?, weight = ?, active = ? WHERE id = ? RETURNING id",
    };
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.resource_id)
        .bind(row.start_date)
        .bind(row.end_date)
        .bind(row.price)
        .bind(row.min_stay)
        .bind(&row.currency)
        .bind(row.important)
        .bind(row.weight)
        .bind(row.active);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save price rule")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_rate_job(tx: &mut Tx<'_>, id: Option<i64>, row: &RateJobRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO rate_queue_jobs (resource_id, endpoint, start_date, end_date, price, min_stay, currency, \
                 price_rule_id, status, retry_count, next_run_at, locked_by, locked_at, last_http_code, last_request_raw, \
                 last_response_raw, failed_reason, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE rate_queue_jobs SET resource_id = ?, endpoint = ?, start_date = ?, end_date = ?, price = ?, \
                    min_stay = ?, currency = ?, price_rule_id = ?, status = ?, retry_count = ?, next_run_at = ?, \
                    locked_by = ?, locked_at = ?, last_http_code = ?, last_request_raw = ?, last_response_raw = ?, \
                    failed_reason = ?, created_at = ?, updated_at = ? WHERE id = ? RETURNING id",
    };
    let d = &row.dispatch;
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.resource_id)
        .bind(&row.endpoint)
        .bind(row.start_date)
        .bind(row.end_date)
        .bind(row.price)
        .bind(row.min_stay)
        .bind(&row.currency)
        .bind(row.price_rule_id)
        .bind(&d.status)
        .bind(d.retry_count)
        .bind(d.next_run_at)
        .bind(&d.locked_by)
        .bind(d.locked_at)
        .bind(d.last_http_code)
        .bind(&d.last_request_raw)
        .bind(&d.last_response_raw)
        .bind(&d.failed_reason)
        .bind(row.created_at)
        .bind(row.updated_at);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save rate queue job")?;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn save_delivery(tx: &mut Tx<'_>, id: Option<i64>, row: &DeliveryRow) -> Result<i64> {
    let sql = match id {
        None => "INSERT INTO rate_deliveries (job_id, mapping_id, status, retry_count, next_run_at, locked_by, locked_at, \
                 last_http_code, last_request_raw, last_response_raw, failed_reason, effective_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        Some(_) => "UPDATE rate_deliveries SET job_id = ?, mapping_id = ?, status = ?, retry_count = ?, next_run_at = ?, \
                    locked_by = ?, locked_at = ?, last_http_code = ?, last_request_raw = ?, last_response_raw = ?, \
                    failed_reason = ?, effective_at = ? WHERE id = ? RETURNING id",
    };
    let d = &row.dispatch;
    let mut query = sqlx::query_scalar::<_, i64>(sql)
        .bind(row.job_id)
        .bind(row.mapping_id)
        .bind(&d.status)
        .bind(d.retry_count)
        .bind(d.next_run_at)
        .bind(&d.locked_by)
        .bind(d.locked_at)
        .bind(d.last_http_code)
        .bind(&d.last_request_raw)
        .bind(&d.last_response_raw)
        .bind(&d.failed_reason)
        .bind(row.effective_at);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let saved = query
        .fetch_one(&mut **tx)
        .await
        .context("failed to save rate delivery")?;
    Ok(saved)
}

/// Tables the session may delete from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Resources,
    ExternalMappings,
    Reservations,
    CalendarEvents,
    SyncLinks,
    PushJobs,
    PriceRules,
    RateQueueJobs,
    RateDeliveries,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Resources => "resources",
            Table::ExternalMappings => "external_mappings",
            Table::Reservations => "reservations",
            Table::CalendarEvents => "calendar_events",
            Table::SyncLinks => "sync_links",
            Table::PushJobs => "push_jobs",
            Table::PriceRules => "price_rules",
            Table::RateQueueJobs => "rate_queue_jobs",
            Table::RateDeliveries => "rate_deliveries",
        }
    }
}

#[instrument(skip_all)]
pub async fn delete_row(tx: &mut Tx<'_>, table: Table, id: i64) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE id = ?", table.as_str());
    sqlx::query(&sql)
        .bind(id)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to delete {} row {}", table.as_str(), id))?;
    Ok(())
}

// ── Aggregates ────────────────────────────────────────────────────

#[instrument(skip_all)]
pub async fn reservation_totals(tx: &mut Tx<'_>, reservation_id: i64) -> Result<ReservationTotals> {
    let totals = sqlx::query_as::<_, ReservationTotals>(
        "SELECT COUNT(*) AS event_count, \
                COALESCE(SUM(price_total), 0) AS total_price, \
                COALESCE(SUM(paid_amount), 0) AS total_paid, \
                COALESCE(SUM(adults + children), 0) AS guest_count, \
                MIN(start_at) AS arrival_at, \
                MAX(end_at) AS departure_at \
         FROM calendar_events WHERE reservation_id = ? AND status != 'cancelled'",
    )
    .bind(reservation_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(totals)
}

/// Write recomputed aggregates. Returns `false` when the reservation is gone.
#[instrument(skip_all)]
pub async fn apply_reservation_totals(
    tx: &mut Tx<'_>,
    reservation_id: i64,
    totals: &ReservationTotals,
    payment_status: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE reservations SET event_count = ?, total_price = ?, total_paid = ?, guest_count = ?, \
         arrival_at = ?, departure_at = ?, payment_status = ? WHERE id = ?",
    )
    .bind(totals.event_count)
    .bind(totals.total_price)
    .bind(totals.total_paid)
    .bind(totals.guest_count)
    .bind(totals.arrival_at)
    .bind(totals.departure_at)
    .bind(payment_status)
    .bind(reservation_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn all_reservation_ids(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM reservations ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        let url = format!("sqlite:{}", path.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }
}
