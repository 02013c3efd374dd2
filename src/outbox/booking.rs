//! Booking change capture: turn pending event/reservation/link writes into
//! push jobs, one open job per link and intent.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, instrument, warn};

use super::jobs::{Enqueued, JobRepository};
use crate::config::SyncConfig;
use crate::db::Tx;
use crate::model::{CalendarEvent, EventStatus, LinkStatus, PushIntent, Reservation, SyncLink};
use crate::session::{ChangeSet, EntityState, Handle, Session};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub created: usize,
    pub merged: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

impl BookingStats {
    fn record(&mut self, enqueued: Enqueued) {
        match enqueued {
            Enqueued::Created(_) => self.created += 1,
            Enqueued::Merged(_) => self.merged += 1,
        }
    }
}

/// What the dispatcher needs to replay a push without reading the link.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PushPayload {
    pub external_room_id: String,
    pub external_property_id: String,
    pub external_booking_id: Option<String>,
    pub root_external_booking_id: Option<String>,
    pub link_status: LinkStatus,
    pub event_status: EventStatus,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub adults: i32,
    pub children: i32,
    pub price_total: i64,
    pub paid_amount: i64,
    pub title: String,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
}

/// Reservations whose pending writes should reach the channel.
///
/// An update touching only ignored fields of a locked, channel-sourced
/// reservation is cosmetic and left out.
fn relevant_reservations(
    session: &Session,
    changes: &ChangeSet,
    ignored: &[String],
) -> BTreeSet<Handle<Reservation>> {
    let mut out: BTreeSet<_> = changes
        .reservations
        .inserted
        .iter()
        .chain(changes.reservations.deleted.iter())
        .copied()
        .collect();
    for update in &changes.reservations.updated {
        let reservation = session.reservations.get(update.handle);
        let cosmetic = reservation.data_locked
            && reservation.origin.is_external()
            && update
                .fields
                .iter()
                .all(|field| ignored.iter().any(|i| i == field));
        if cosmetic {
            debug!(reservation = %session.reservations.key(update.handle), "ignored cosmetic update");
            continue;
        }
        out.insert(update.handle);
    }
    out.extend(changes.dirty_reservations());
    out
}

fn tracked_events_of(session: &Session, reservation: Handle<Reservation>) -> Vec<Handle<CalendarEvent>> {
    session
        .events
        .handles()
        .filter(|event| {
            matches!(
                session.events.state(*event),
                EntityState::New | EntityState::Managed | EntityState::Removed
            ) && session.events.get(*event).reservation == Some(reservation)
        })
        .collect()
}

/// Links touched directly, through their event or through the event's
/// reservation. Links that are already gone remotely, or whose event has no
/// dates, are left out.
pub fn affected_links(
    session: &Session,
    changes: &ChangeSet,
    ignored: &[String],
) -> BTreeSet<Handle<SyncLink>> {
    let mut events: BTreeSet<_> = changes.events.touched().collect();
    for reservation in relevant_reservations(session, changes, ignored) {
        events.extend(tracked_events_of(session, reservation));
    }

    let mut links: BTreeSet<_> = changes.links.touched().collect();
    for event in events {
        links.extend(session.tracked_links_of(event));
    }
    links.retain(|link| {
        let l = session.links.get(*link);
        l.status != LinkStatus::SyncedDeleted && session.events.get(l.event).has_dates()
    });
    links
}

fn payload(session: &Session, link: Handle<SyncLink>, external_id: Option<String>) -> Option<PushPayload> {
    let l = session.links.get(link);
    let mapping = session.mappings.get(l.mapping?);
    let event = session.events.get(l.event);
    let reservation = event.reservation.map(|r| session.reservations.get(r));
    let root_external_booking_id = match l.origin_link {
        Some(root) => session.links.get(root).external_booking_id.clone(),
        None => external_id.clone(),
    };
    Some(PushPayload {
        external_room_id: mapping.external_room_id.clone(),
        external_property_id: mapping.external_property_id.clone(),
        external_booking_id: external_id,
        root_external_booking_id,
        link_status: l.status,
        event_status: event.status,
        start_at: event.start_at,
        end_at: event.end_at,
        adults: event.adults,
        children: event.children,
        price_total: event.price_total,
        paid_amount: event.paid_amount,
        title: event.title.clone(),
        guest_name: reservation.map(|r| r.guest_name.clone()),
        guest_email: reservation.and_then(|r| r.guest_email.clone()),
        guest_phone: reservation.and_then(|r| r.guest_phone.clone()),
    })
}

/// Event only lives in memory: never scheduled or no longer tracked.
fn is_orphan(session: &Session, event: Handle<CalendarEvent>) -> bool {
    matches!(
        session.events.state(event),
        EntityState::Transient | EntityState::Detached
    )
}

#[instrument(skip_all)]
pub async fn capture_booking_changes(
    session: &mut Session,
    tx: &mut Tx<'_>,
    changes: &ChangeSet,
    config: &SyncConfig,
) -> Result<BookingStats> {
    let links = affected_links(session, changes, &config.ignored_reservation_fields);
    let mut stats = BookingStats::default();
    let mut repo = JobRepository::new(session, tx);

    // Jobs created earlier in this transaction for links that were dropped again.
    let stranded: Vec<_> = repo
        .session
        .push_jobs
        .live()
        .filter(|(h, job)| {
            repo.session.push_jobs.state(*h) == EntityState::New
                && job.link.is_some_and(|l| {
                    matches!(
                        repo.session.links.state(l),
                        EntityState::Transient | EntityState::Detached
                    )
                })
        })
        .map(|(h, _)| h)
        .collect();
    for job in stranded {
        repo.session.push_jobs.remove(job);
        stats.cancelled += 1;
    }

    for link in links {
        let (mapping, status, event) = {
            let l = repo.session.links.get(link);
            (l.mapping, l.status, l.event)
        };
        if mapping.is_none() {
            stats.skipped += 1;
            continue;
        }
        if is_orphan(repo.session, event) {
            warn!(link = %repo.session.links.key(link), "skipping link of an orphaned event");
            stats.skipped += 1;
            continue;
        }

        let deleting =
            repo.session.links.state(link) == EntityState::Removed || status == LinkStatus::PendingDelete;
        if deleting {
            let external_id = repo.external_id(link).await?;
            let pending_create = repo.open_push_job(link, PushIntent::Upsert).await?;
            let Some(external_id) = external_id else {
                // Never reached the channel: drop the create instead of deleting.
                if let Some(job) = pending_create {
                    repo.cancel_push_job(job, "link removed before it was pushed");
                    stats.cancelled += 1;
                } else {
                    stats.skipped += 1;
                }
                continue;
            };
            let Some(endpoint) = config.endpoints.booking_delete.as_deref() else {
                stats.skipped += 1;
                continue;
            };
            if let Some(job) = pending_create {
                repo.cancel_push_job(job, "superseded by delete");
                stats.cancelled += 1;
            }
            let Some(body) = payload(repo.session, link, Some(external_id.clone())) else {
                continue;
            };
            let enqueued = repo
                .enqueue_push(link, endpoint, PushIntent::Delete, serde_json::to_value(body)?, Some(external_id))
                .await?;
            stats.record(enqueued);
            continue;
        }

        if !matches!(status, LinkStatus::Active | LinkStatus::PendingMove) {
            stats.skipped += 1;
            continue;
        }
        let Some(endpoint) = config.endpoints.booking_upsert.as_deref() else {
            stats.skipped += 1;
            continue;
        };
        let external_id = repo.session.links.get(link).external_booking_id.clone();
        let Some(body) = payload(repo.session, link, external_id.clone()) else {
            continue;
        };
        let enqueued = repo
            .enqueue_push(link, endpoint, PushIntent::Upsert, serde_json::to_value(body)?, external_id)
            .await?;
        stats.record(enqueued);
    }

    if stats != BookingStats::default() {
        debug!(?stats, "booking outbox");
    }
    Ok(stats)
}
