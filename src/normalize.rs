//! Derived fields recomputed before anything downstream reads them.

use crate::model::{CalendarEvent, EventStatus, Reservation};
use crate::session::{ChangeSet, Session};

fn status_label(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Tentative => "Tentative",
        EventStatus::Confirmed => "Booked",
        EventStatus::CheckedIn => "In house",
        EventStatus::CheckedOut => "Departed",
        EventStatus::Cancelled => "Cancelled",
        EventStatus::Blocked => "Blocked",
    }
}

/// Calendar title: guest name (or status label) and head count.
pub fn display_title(event: &CalendarEvent, reservation: Option<&Reservation>) -> String {
    let name = reservation
        .map(|r| r.guest_name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| status_label(event.status));
    let mut title = match (event.status, reservation) {
        (EventStatus::Cancelled, Some(_)) => format!("{name} (cancelled)"),
        _ => name.to_string(),
    };
    let guests = event.adults + event.children;
    if guests > 0 {
        title.push_str(&format!(" · {guests}p"));
    }
    title
}

/// Refresh the cached title of every event whose own fields or reservation
/// changed. Returns how many titles moved.
pub fn refresh_titles(session: &mut Session, changes: &ChangeSet) -> usize {
    let mut events: Vec<_> = changes.events.touched().collect();
    for update in &changes.reservations.updated {
        events.extend(session.events_of(update.handle));
    }
    events.sort();
    events.dedup();

    let mut refreshed = 0;
    for handle in events {
        if !session.events.is_live(handle) {
            continue;
        }
        let event = session.events.get(handle);
        let reservation = event.reservation.map(|r| session.reservations.get(r));
        let title = display_title(event, reservation);
        if event.title != title {
            session.events.get_mut(handle).title = title;
            refreshed += 1;
        }
    }
    refreshed
}
