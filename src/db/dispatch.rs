//! Claim and write-back helpers for the worker that drains the outbox tables.
//!
//! Workers never hold in-process locks: a row is claimed by flipping it from
//! `pending` to `processing` with an `UPDATE … WHERE locked_by IS NULL`, and
//! every write-back is conditioned on still owning that claim.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::repo::Pool;

/// Outbox tables a dispatcher polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxTable {
    PushJobs,
    RateQueueJobs,
    RateDeliveries,
}

impl OutboxTable {
    pub const ALL: [OutboxTable; 3] = [
        OutboxTable::PushJobs,
        OutboxTable::RateQueueJobs,
        OutboxTable::RateDeliveries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxTable::PushJobs => "push_jobs",
            OutboxTable::RateQueueJobs => "rate_queue_jobs",
            OutboxTable::RateDeliveries => "rate_deliveries",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub max_backoff_secs: i64,
}

/// Result of one remote call as reported by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub http_code: Option<i32>,
    pub request_raw: Option<String>,
    pub response_raw: Option<String>,
    /// `None` on success.
    pub error: Option<String>,
}

pub fn new_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

/// Exponential backoff: 5s * 2^attempt, capped.
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

/// Claim the oldest due row of `table`. Returns its id.
#[instrument(skip_all, fields(table = table.as_str()))]
pub async fn claim_next(
    pool: &Pool,
    table: OutboxTable,
    worker: &str,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let select = format!(
        "SELECT id FROM {} WHERE status = 'pending' AND locked_by IS NULL AND next_run_at <= ? \
         ORDER BY next_run_at ASC, id ASC LIMIT 1",
        table.as_str()
    );
    let claim = format!(
        "UPDATE {} SET status = 'processing', locked_by = ?, locked_at = ? \
         WHERE id = ? AND status = 'pending' AND locked_by IS NULL",
        table.as_str()
    );

    // Another worker may win the race for a candidate; try the next one.
    for _ in 0..5 {
        let candidate = sqlx::query_scalar::<_, i64>(&select)
            .bind(now)
            .fetch_optional(pool)
            .await?;
        let Some(id) = candidate else {
            return Ok(None);
        };
        let res = sqlx::query(&claim)
            .bind(worker)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
        if res.rows_affected() == 1 {
            debug!(id, worker, "claimed outbox row");
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Record the outcome of a claimed row and release the claim.
///
/// Returns `false` when `worker` no longer owns the row (it was re-queued by a
/// newer local change), in which case nothing is written.
#[instrument(skip_all, fields(table = table.as_str(), id = id))]
pub async fn complete(
    pool: &Pool,
    table: OutboxTable,
    id: i64,
    worker: &str,
    outcome: &DispatchOutcome,
    policy: RetryPolicy,
    now: DateTime<Utc>,
) -> Result<bool> {
    let owned = format!(
        "SELECT retry_count FROM {} WHERE id = ? AND locked_by = ?",
        table.as_str()
    );
    let attempt = sqlx::query_scalar::<_, i32>(&owned)
        .bind(id)
        .bind(worker)
        .fetch_optional(pool)
        .await?;
    let Some(attempt) = attempt else {
        return Ok(false);
    };

    let (status, retry_count, next_run_at) = match &outcome.error {
        None => ("success", attempt, now),
        Some(_) if attempt + 1 >= policy.max_attempts => ("failed", attempt + 1, now),
        Some(_) => (
            "pending",
            attempt + 1,
            now + Duration::seconds(backoff_secs(attempt, policy.max_backoff_secs)),
        ),
    };

    let update = format!(
        "UPDATE {} SET status = ?, retry_count = ?, next_run_at = ?, locked_by = NULL, locked_at = NULL, \
         last_http_code = ?, last_request_raw = ?, last_response_raw = ?, failed_reason = ? \
         WHERE id = ? AND locked_by = ?",
        table.as_str()
    );
    let res = sqlx::query(&update)
        .bind(status)
        .bind(retry_count)
        .bind(next_run_at)
        .bind(outcome.http_code)
        .bind(&outcome.request_raw)
        .bind(&outcome.response_raw)
        .bind(&outcome.error)
        .bind(id)
        .bind(worker)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Store the booking id the channel assigned for a push job on both the job
/// and its link, while the dispatcher still holds the claim.
#[instrument(skip_all, fields(id = job_id))]
pub async fn record_external_booking_id(
    pool: &Pool,
    job_id: i64,
    worker: &str,
    external_id: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE push_jobs SET external_id_at_creation = ? WHERE id = ? AND locked_by = ?",
    )
    .bind(external_id)
    .bind(job_id)
    .bind(worker)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    sqlx::query(
        "UPDATE sync_links SET external_booking_id = ? \
         WHERE id = (SELECT link_id FROM push_jobs WHERE id = ?)",
    )
    .bind(external_id)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all, fields(table = table.as_str()))]
pub async fn count_pending(pool: &Pool, table: OutboxTable) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE status = 'pending'",
        table.as_str()
    );
    let count = sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?;
    Ok(count)
}
