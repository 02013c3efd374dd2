//! Transaction boundary: every stage runs against one sqlx transaction, in a
//! fixed order, and the aggregate pass follows once it has committed.

use anyhow::Context;
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::db::{Pool, Tx};
use crate::error::SyncError;
use crate::guards::{self, GuardReport};
use crate::links::{self, ReconcileStats};
use crate::normalize;
use crate::outbox::{capture_booking_changes, capture_rate_changes, BookingStats, RateStats};
use crate::recalc::{AggregateRecalculator, TouchedReservations};
use crate::session::flush::FlushStats;
use crate::session::{capture_changes, ChangeSet, Session};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub guards: GuardReport,
    pub titles: usize,
    pub links: ReconcileStats,
    pub bookings: BookingStats,
    pub rates: RateStats,
    pub flushed: FlushStats,
    pub recalculated: usize,
}

pub struct SyncEngine {
    pool: Pool,
    sync: SyncConfig,
    recalculator: AggregateRecalculator,
}

impl SyncEngine {
    pub fn new(pool: Pool, sync: SyncConfig) -> Self {
        Self {
            pool,
            sync,
            recalculator: AggregateRecalculator::new(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn recalculator(&self) -> &AggregateRecalculator {
        &self.recalculator
    }

    /// Write `session` and everything its changes imply.
    ///
    /// On error the transaction is rolled back and the session must be
    /// discarded: ids handed out by the flush are no longer valid.
    #[instrument(skip_all)]
    pub async fn commit(&self, session: &mut Session) -> Result<CommitReport, SyncError> {
        let mut tx = self.pool.begin().await?;
        let (mut report, touched) = match self.run_stages(session, &mut tx).await {
            Ok(done) => done,
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                match &err {
                    SyncError::Rejected(violation) => warn!(%violation, "commit rejected"),
                    other => warn!(error = %other, "commit failed"),
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        self.recalculator.schedule(touched);
        report.recalculated = self.recalculator.run(&self.pool).await;

        info!(
            links_created = report.links.created,
            pushes_created = report.bookings.created,
            pushes_merged = report.bookings.merged,
            pushes_cancelled = report.bookings.cancelled,
            rate_jobs_created = report.rates.created,
            rate_jobs_merged = report.rates.merged,
            recalculated = report.recalculated,
            "commit done"
        );
        Ok(report)
    }

    async fn run_stages(
        &self,
        session: &mut Session,
        tx: &mut Tx<'_>,
    ) -> Result<(CommitReport, BTreeSet<i64>), SyncError> {
        let mut report = CommitReport::default();

        let changes = capture_changes(session);
        hydrate(session, tx, &changes).await?;

        report.guards = guards::enforce(session, tx, &changes).await?;
        let changes = capture_changes(session);

        report.titles = normalize::refresh_titles(session, &changes);

        let events = links::touched_events(session, &changes);
        report.links = links::reconcile_all(session, events.iter().copied());
        for event in events {
            links::verify_links(session, event).map_err(SyncError::Storage)?;
        }

        let changes = capture_changes(session);
        report.bookings = capture_booking_changes(session, tx, &changes, &self.sync).await?;
        report.rates = capture_rate_changes(session, tx, &changes, &self.sync).await?;
        let touched = TouchedReservations::collect(session, &changes);

        report.flushed = session.flush(tx).await?;
        Ok((report, touched.resolve(session)))
    }
}

/// Pull in the committed events whose links a mapping change affects, so the
/// reconciler sees them.
///
/// A mapping that is new, re-activated or moved needs links on every event of
/// its resource, so those are loaded in full. Other mapping changes only
/// reach the events already linked through it.
async fn hydrate(session: &mut Session, tx: &mut Tx<'_>, changes: &ChangeSet) -> Result<(), SyncError> {
    let mut opened = changes.mappings.inserted.clone();
    for update in &changes.mappings.updated {
        let mapping = session.mappings.get(update.handle);
        let reactivated = update.touches("active")
            && mapping.active
            && session.mappings.original(update.handle).is_some_and(|m| !m.active);
        if reactivated || (update.touches("resource") && mapping.active) {
            opened.push(update.handle);
        }
    }
    let mut resources = BTreeSet::new();
    for mapping in opened {
        if !session.mappings.get(mapping).active {
            continue;
        }
        if let Some(id) = session.resources.id(session.mappings.get(mapping).resource) {
            resources.insert(id);
        }
    }
    for id in resources {
        session
            .load_events_of_resource(tx, id)
            .await
            .with_context(|| format!("failed to load events of resource {}", id))?;
    }

    for mapping in changes.mappings.touched() {
        let Some(id) = session.mappings.id(mapping) else {
            continue;
        };
        session
            .load_events_linked_to_mapping(tx, id)
            .await
            .with_context(|| format!("failed to load events linked to mapping {}", id))?;
    }
    Ok(())
}
