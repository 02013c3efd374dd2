use std::collections::BTreeSet;

use super::{Arena, Entity, EntityState, Handle, Session};
use crate::model::{CalendarEvent, ExternalMapping, PriceRule, Reservation, SyncLink};

#[derive(Debug, Clone)]
pub struct Update<T> {
    pub handle: Handle<T>,
    pub fields: Vec<&'static str>,
}

impl<T> Update<T> {
    pub fn touches(&self, field: &str) -> bool {
        self.fields.iter().any(|f| *f == field)
    }
}

/// Pending writes of one entity kind.
#[derive(Debug, Clone)]
pub struct Changes<T> {
    pub inserted: Vec<Handle<T>>,
    pub updated: Vec<Update<T>>,
    pub deleted: Vec<Handle<T>>,
}

impl<T: Entity> Changes<T> {
    fn capture(arena: &Arena<T>) -> Self {
        let mut changes = Changes {
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        };
        for handle in arena.handles() {
            match arena.state(handle) {
                EntityState::New => changes.inserted.push(handle),
                EntityState::Managed => {
                    let fields = arena.changed_fields(handle);
                    if !fields.is_empty() {
                        changes.updated.push(Update { handle, fields });
                    }
                }
                EntityState::Removed => changes.deleted.push(handle),
                _ => {}
            }
        }
        changes
    }
}

impl<T> Changes<T> {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Every handle with a pending write, in insert/update/delete order.
    pub fn touched(&self) -> impl Iterator<Item = Handle<T>> + '_ {
        self.inserted
            .iter()
            .copied()
            .chain(self.updated.iter().map(|u| u.handle))
            .chain(self.deleted.iter().copied())
    }

    pub fn update_of(&self, handle: Handle<T>) -> Option<&Update<T>> {
        self.updated.iter().find(|u| u.handle == handle)
    }

    pub fn is_deleted(&self, handle: Handle<T>) -> bool {
        self.deleted.contains(&handle)
    }
}

/// A to-many relation whose member list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Association {
    ReservationEvents(Handle<Reservation>),
    EventLinks(Handle<CalendarEvent>),
}

/// Everything the pre-commit stages consume, computed from session state.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub mappings: Changes<ExternalMapping>,
    pub reservations: Changes<Reservation>,
    pub events: Changes<CalendarEvent>,
    pub links: Changes<SyncLink>,
    pub price_rules: Changes<PriceRule>,
    pub dirty_associations: Vec<Association>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
            && self.reservations.is_empty()
            && self.events.is_empty()
            && self.links.is_empty()
            && self.price_rules.is_empty()
    }

    /// Reservations whose event list changed.
    pub fn dirty_reservations(&self) -> impl Iterator<Item = Handle<Reservation>> + '_ {
        self.dirty_associations.iter().filter_map(|a| match a {
            Association::ReservationEvents(h) => Some(*h),
            _ => None,
        })
    }

    /// Events whose link list changed.
    pub fn dirty_events(&self) -> impl Iterator<Item = Handle<CalendarEvent>> + '_ {
        self.dirty_associations.iter().filter_map(|a| match a {
            Association::EventLinks(h) => Some(*h),
            _ => None,
        })
    }
}

/// Snapshot the pending writes of a session. Pure; safe to call repeatedly
/// after stages add records.
pub fn capture_changes(session: &Session) -> ChangeSet {
    let events = Changes::capture(&session.events);
    let links = Changes::capture(&session.links);

    let mut dirty = BTreeSet::new();
    for handle in events.inserted.iter().chain(events.deleted.iter()) {
        if let Some(reservation) = session.events.get(*handle).reservation {
            dirty.insert(Association::ReservationEvents(reservation));
        }
    }
    for update in events.updated.iter().filter(|u| u.touches("reservation")) {
        let current = session.events.get(update.handle).reservation;
        let previous = session
            .events
            .original(update.handle)
            .and_then(|e| e.reservation);
        for reservation in [current, previous].into_iter().flatten() {
            dirty.insert(Association::ReservationEvents(reservation));
        }
    }
    for handle in links.inserted.iter().chain(links.deleted.iter()) {
        dirty.insert(Association::EventLinks(session.links.get(*handle).event));
    }

    ChangeSet {
        mappings: Changes::capture(&session.mappings),
        reservations: Changes::capture(&session.reservations),
        events,
        links,
        price_rules: Changes::capture(&session.price_rules),
        dirty_associations: dirty.into_iter().collect(),
    }
}
