//! Reservation aggregates (totals, head count, stay dates) recomputed after
//! the transaction that touched them has committed.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use crate::db::{self, Pool};
use crate::model::{PaymentStatus, Reservation};
use crate::session::{ChangeSet, EntityState, Handle, Session};

/// Reservations a transaction touched. Unsaved ones are held by handle until
/// the flush gives them an id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedReservations {
    ids: BTreeSet<i64>,
    unsaved: BTreeSet<Handle<Reservation>>,
}

impl TouchedReservations {
    pub fn collect(session: &Session, changes: &ChangeSet) -> Self {
        let mut handles: BTreeSet<_> = changes
            .reservations
            .inserted
            .iter()
            .copied()
            .chain(changes.reservations.updated.iter().map(|u| u.handle))
            .collect();
        handles.extend(changes.dirty_reservations());
        for event in changes.events.touched() {
            handles.extend(session.events.get(event).reservation);
            if let Some(original) = session.events.original(event) {
                handles.extend(original.reservation);
            }
        }

        let mut touched = TouchedReservations::default();
        for handle in handles {
            match (session.reservations.state(handle), session.reservations.id(handle)) {
                (EntityState::Removed | EntityState::Deleted, _) => {}
                (_, Some(id)) => {
                    touched.ids.insert(id);
                }
                (EntityState::New, None) => {
                    touched.unsaved.insert(handle);
                }
                _ => {}
            }
        }
        touched
    }

    /// Final ids, once the session has been flushed.
    pub fn resolve(self, session: &Session) -> BTreeSet<i64> {
        let mut ids = self.ids;
        ids.extend(
            self.unsaved
                .into_iter()
                .filter_map(|handle| session.reservations.id(handle)),
        );
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.unsaved.is_empty()
    }
}

/// Recompute and store the aggregates of `ids` in one transaction. Returns how
/// many reservations still existed.
#[instrument(skip_all, fields(count = ids.len()))]
pub async fn recalculate(pool: &Pool, ids: &[i64]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let mut updated = 0;
    for id in ids {
        let totals = db::reservation_totals(&mut tx, *id)
            .await
            .with_context(|| format!("failed to total reservation {}", id))?;
        let payment = PaymentStatus::from_totals(totals.total_price, totals.total_paid);
        if db::apply_reservation_totals(&mut tx, *id, &totals, payment.as_str()).await? {
            updated += 1;
        }
    }
    tx.commit().await?;
    Ok(updated)
}

/// Post-commit queue of reservation ids. Ids from a failed pass stay queued
/// for the next commit or sweep.
#[derive(Debug, Default)]
pub struct AggregateRecalculator {
    pending: Mutex<BTreeSet<i64>>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AggregateRecalculator {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, BTreeSet<i64>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schedule(&self, ids: impl IntoIterator<Item = i64>) {
        self.queue().extend(ids);
    }

    pub fn pending(&self) -> Vec<i64> {
        self.queue().iter().copied().collect()
    }

    /// Drain the queue once. A pass already in flight makes this a no-op;
    /// its queue is picked up by the next call.
    pub async fn run(&self, pool: &Pool) -> usize {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("recalculation already running");
            return 0;
        }
        let _running = RunningGuard(&self.running);

        let ids: Vec<i64> = std::mem::take(&mut *self.queue()).into_iter().collect();
        if ids.is_empty() {
            return 0;
        }
        match recalculate(pool, &ids).await {
            Ok(updated) => {
                debug!(updated, "reservation aggregates recalculated");
                updated
            }
            Err(err) => {
                warn!(?err, ?ids, "reservation recalculation failed; will retry");
                self.schedule(ids);
                0
            }
        }
    }
}
