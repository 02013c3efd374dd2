//! Transaction-time checks on calendar events. A violation rejects the whole
//! commit; a few channel-owned fields are quietly put back instead.

use tracing::{debug, instrument};

use crate::db::Tx;
use crate::error::{GuardViolation, SyncError};
use crate::model::CalendarEvent;
use crate::outbox::JobRepository;
use crate::session::{ChangeSet, Handle, Session};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardReport {
    /// Channel-owned fields restored to their loaded value.
    pub corrected: usize,
}

/// `end` must be strictly after `start` on every inserted or updated event.
pub fn check_durations(session: &Session, changes: &ChangeSet) -> Result<(), GuardViolation> {
    let written = changes
        .events
        .inserted
        .iter()
        .copied()
        .chain(changes.events.updated.iter().map(|u| u.handle));
    for handle in written {
        let event = session.events.get(handle);
        if let (Some(start), Some(end)) = (event.start_at, event.end_at) {
            if end <= start {
                return Err(GuardViolation::InvalidDuration {
                    event: session.events.key(handle),
                    start,
                    end,
                });
            }
        }
    }
    Ok(())
}

/// Outside the inbound sync path, a channel-sourced event may not be cancelled
/// or moved out of a committed status. Its origin flag is restored silently.
pub fn check_locked_fields(session: &mut Session, changes: &ChangeSet) -> Result<usize, GuardViolation> {
    if session.context.inbound_sync {
        return Ok(0);
    }
    let mut corrected = 0;
    for update in &changes.events.updated {
        let Some(original) = session.events.original(update.handle).cloned() else {
            continue;
        };
        if !original.origin.is_external() {
            continue;
        }
        let key = session.events.key(update.handle);
        if update.touches("origin") {
            session.events.get_mut(update.handle).origin = original.origin;
            debug!(event = %key, "restored channel origin");
            corrected += 1;
        }
        if !update.touches("status") {
            continue;
        }
        let status = session.events.get(update.handle).status;
        if status.is_closed() && !original.status.is_closed() {
            return Err(GuardViolation::LockedField {
                event: key,
                rule: "only the channel can cancel or block it",
            });
        }
        if original.status.is_committed() && !status.is_committed() {
            return Err(GuardViolation::LockedField {
                event: key,
                rule: "only the channel can downgrade its status",
            });
        }
    }
    Ok(corrected)
}

/// Decide whether one deleted event may go.
async fn check_delete(
    repo: &mut JobRepository<'_, '_>,
    event: Handle<CalendarEvent>,
) -> Result<(), SyncError> {
    let key = repo.session.events.key(event);
    let loaded = repo
        .session
        .events
        .original(event)
        .cloned()
        .unwrap_or_else(|| repo.session.events.get(event).clone());
    if loaded.origin.is_external() {
        return Err(GuardViolation::UnsafeDelete {
            event: key,
            rule: "it was imported from a channel",
        }
        .into());
    }

    let links = repo.session.tracked_links_of(event);
    let mut pushed = false;
    for link in &links {
        if repo.external_id(*link).await?.is_some() {
            pushed = true;
            break;
        }
    }
    if !pushed {
        return Ok(());
    }

    if !loaded.status.is_closed() {
        return Err(GuardViolation::UnsafeDelete {
            event: key,
            rule: "it is still booked on a channel; cancel it first",
        }
        .into());
    }
    for link in links {
        if repo.has_open_push_jobs(link).await? {
            return Err(GuardViolation::UnsafeDelete {
                event: key,
                rule: "its channel updates are still being sent",
            }
            .into());
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn enforce(
    session: &mut Session,
    tx: &mut Tx<'_>,
    changes: &ChangeSet,
) -> Result<GuardReport, SyncError> {
    check_durations(session, changes)?;
    let corrected = check_locked_fields(session, changes)?;

    let mut repo = JobRepository::new(session, tx);
    for event in &changes.events.deleted {
        check_delete(&mut repo, *event).await?;
    }
    Ok(GuardReport { corrected })
}
