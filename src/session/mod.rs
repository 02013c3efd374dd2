//! Unit of work over the local booking/pricing state.
//!
//! A `Session` holds one typed arena per entity kind. Entities reference each
//! other through `Handle`s (arena indices), so records that have not been
//! written yet can be linked before they own a database id. The arena also
//! keeps the identity map (`id -> handle`) and the original snapshot used to
//! compute field-level changes.
//!
//! - `changes`: `capture_changes` turns the arenas into a `ChangeSet`.
//! - `load`: pulls committed rows into the session.
//! - `flush`: writes pending inserts/updates/deletes inside a transaction.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::model::{
    CalendarEvent, ExternalMapping, PriceRule, PushJob, RateDelivery, RateQueueJob, Reservation,
    Resource, SyncLink,
};

pub mod changes;
pub mod flush;
pub mod load;

pub use changes::{capture_changes, Association, ChangeSet, Changes, Update};

/// Implemented by every record kind a session tracks.
pub trait Entity: Clone + fmt::Debug {
    const KIND: &'static str;

    /// Names of the fields that differ from `original`.
    fn changed_fields(&self, original: &Self) -> Vec<&'static str>;
}

/// Process-local identity of a tracked entity.
pub struct Handle<T> {
    index: usize,
    marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize) -> Self {
        Self {
            index,
            marker: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

/// Stable, printable identity: the stored id once there is one.
///
/// Ordering puts every stored record before every pending one, and pending
/// records in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Stored(i64),
    Pending(usize),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Stored(id) => write!(f, "{id}"),
            Key::Pending(index) => write!(f, "new-{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Built in memory but never scheduled for insert.
    Transient,
    /// Scheduled for insert.
    New,
    /// Loaded from (or already written to) storage.
    Managed,
    /// Scheduled for delete.
    Removed,
    /// Deleted by a flush.
    Deleted,
    /// No longer tracked for changes.
    Detached,
}

impl EntityState {
    pub fn is_live(self) -> bool {
        matches!(self, EntityState::New | EntityState::Managed)
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    id: Option<i64>,
    state: EntityState,
    original: Option<T>,
    current: T,
}

/// Typed storage for one entity kind plus its identity map.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    by_id: HashMap<i64, Handle<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<T: Entity> Arena<T> {
    fn push(&mut self, id: Option<i64>, state: EntityState, value: T) -> Handle<T> {
        let handle = Handle::new(self.slots.len());
        let original = id.map(|_| value.clone());
        self.slots.push(Slot {
            id,
            state,
            original,
            current: value,
        });
        if let Some(id) = id {
            self.by_id.insert(id, handle);
        }
        handle
    }

    /// Track a new record and schedule it for insert.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.push(None, EntityState::New, value)
    }

    /// Track a new record without scheduling it.
    pub fn stage(&mut self, value: T) -> Handle<T> {
        self.push(None, EntityState::Transient, value)
    }

    /// Schedule a staged record for insert. No-op for anything else.
    pub fn register_for_persist(&mut self, handle: Handle<T>) {
        let slot = &mut self.slots[handle.index];
        if slot.state == EntityState::Transient {
            slot.state = EntityState::New;
        }
    }

    /// Track a committed row. Returns the existing handle if the id is known.
    pub(crate) fn adopt(&mut self, id: i64, value: T) -> Handle<T> {
        if let Some(handle) = self.by_id.get(&id) {
            return *handle;
        }
        self.push(Some(id), EntityState::Managed, value)
    }

    pub fn get(&self, handle: Handle<T>) -> &T {
        &self.slots[handle.index].current
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> &mut T {
        &mut self.slots[handle.index].current
    }

    /// Value as last loaded or flushed; `None` for records never stored.
    pub fn original(&self, handle: Handle<T>) -> Option<&T> {
        self.slots[handle.index].original.as_ref()
    }

    pub fn state(&self, handle: Handle<T>) -> EntityState {
        self.slots[handle.index].state
    }

    pub fn id(&self, handle: Handle<T>) -> Option<i64> {
        self.slots[handle.index].id
    }

    pub fn key(&self, handle: Handle<T>) -> Key {
        match self.slots[handle.index].id {
            Some(id) => Key::Stored(id),
            None => Key::Pending(handle.index),
        }
    }

    pub fn handle_of(&self, id: i64) -> Option<Handle<T>> {
        self.by_id.get(&id).copied()
    }

    pub fn is_live(&self, handle: Handle<T>) -> bool {
        self.state(handle).is_live()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle<T>> + '_ {
        (0..self.slots.len()).map(Handle::new)
    }

    /// Records scheduled for insert or already managed.
    pub fn live(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_live())
            .map(|(index, slot)| (Handle::new(index), &slot.current))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Field names changed since load; empty for untracked states.
    pub fn changed_fields(&self, handle: Handle<T>) -> Vec<&'static str> {
        let slot = &self.slots[handle.index];
        match (&slot.state, &slot.original) {
            (EntityState::Managed, Some(original)) => slot.current.changed_fields(original),
            _ => Vec::new(),
        }
    }

    /// Schedule a record for delete. A record that was never written just
    /// falls back to `Transient`.
    pub fn remove(&mut self, handle: Handle<T>) {
        let slot = &mut self.slots[handle.index];
        slot.state = match slot.state {
            EntityState::New => EntityState::Transient,
            EntityState::Managed => EntityState::Removed,
            other => other,
        };
    }

    pub fn detach(&mut self, handle: Handle<T>) {
        self.slots[handle.index].state = EntityState::Detached;
    }

    /// Apply a fix-up to both the current and original value of a freshly
    /// loaded row so it does not count as a change.
    pub(crate) fn patch_loaded(&mut self, handle: Handle<T>, patch: impl Fn(&mut T)) {
        let slot = &mut self.slots[handle.index];
        patch(&mut slot.current);
        if let Some(original) = slot.original.as_mut() {
            patch(original);
        }
    }

    pub(crate) fn mark_stored(&mut self, handle: Handle<T>, id: i64) {
        let slot = &mut self.slots[handle.index];
        slot.id = Some(id);
        slot.state = EntityState::Managed;
        slot.original = Some(slot.current.clone());
        self.by_id.insert(id, handle);
    }

    pub(crate) fn mark_synced(&mut self, handle: Handle<T>) {
        let slot = &mut self.slots[handle.index];
        slot.original = Some(slot.current.clone());
    }

    pub(crate) fn mark_deleted(&mut self, handle: Handle<T>) {
        let slot = &mut self.slots[handle.index];
        slot.state = EntityState::Deleted;
        if let Some(id) = slot.id {
            self.by_id.remove(&id);
        }
    }
}

/// Per-transaction facts the stages need besides the records themselves.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub now: DateTime<Utc>,
    /// Set by the inbound webhook/import path; unlocks channel-owned fields.
    pub inbound_sync: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub context: SessionContext,
    pub resources: Arena<Resource>,
    pub mappings: Arena<ExternalMapping>,
    pub reservations: Arena<Reservation>,
    pub events: Arena<CalendarEvent>,
    pub links: Arena<SyncLink>,
    pub push_jobs: Arena<PushJob>,
    pub price_rules: Arena<PriceRule>,
    pub rate_jobs: Arena<RateQueueJob>,
    pub deliveries: Arena<RateDelivery>,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_context(SessionContext {
            now,
            inbound_sync: false,
        })
    }

    /// Session for the inbound channel sync path.
    pub fn inbound(now: DateTime<Utc>) -> Self {
        Self::with_context(SessionContext {
            now,
            inbound_sync: true,
        })
    }

    pub fn with_context(context: SessionContext) -> Self {
        Self {
            context,
            resources: Arena::default(),
            mappings: Arena::default(),
            reservations: Arena::default(),
            events: Arena::default(),
            links: Arena::default(),
            push_jobs: Arena::default(),
            price_rules: Arena::default(),
            rate_jobs: Arena::default(),
            deliveries: Arena::default(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.context.now
    }

    /// Remove a reservation together with its events and their links.
    pub fn remove_reservation(&mut self, handle: Handle<Reservation>) {
        for event in self.events_of(handle) {
            self.remove_event(event);
        }
        self.reservations.remove(handle);
    }

    /// Remove an event together with its links.
    pub fn remove_event(&mut self, handle: Handle<CalendarEvent>) {
        for link in self.live_links_of(handle) {
            self.links.remove(link);
        }
        self.events.remove(handle);
    }

    pub fn events_of(&self, reservation: Handle<Reservation>) -> Vec<Handle<CalendarEvent>> {
        self.events
            .live()
            .filter(|(_, event)| event.reservation == Some(reservation))
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn live_links_of(&self, event: Handle<CalendarEvent>) -> Vec<Handle<SyncLink>> {
        self.links
            .live()
            .filter(|(_, link)| link.event == event)
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Links of an event that are live or scheduled for delete.
    pub fn tracked_links_of(&self, event: Handle<CalendarEvent>) -> Vec<Handle<SyncLink>> {
        self.links
            .handles()
            .filter(|handle| {
                matches!(
                    self.links.state(*handle),
                    EntityState::New | EntityState::Managed | EntityState::Removed
                ) && self.links.get(*handle).event == event
            })
            .collect()
    }

    /// Active mappings of a resource, ordered by mapping key.
    pub fn active_mappings(&self, resource: Handle<Resource>) -> Vec<Handle<ExternalMapping>> {
        let mut mappings: Vec<_> = self
            .mappings
            .live()
            .filter(|(_, mapping)| mapping.resource == resource && mapping.active)
            .map(|(handle, _)| handle)
            .collect();
        mappings.sort_by_key(|handle| self.mappings.key(*handle));
        mappings
    }

    pub fn events_of_resource(&self, resource: Handle<Resource>) -> Vec<Handle<CalendarEvent>> {
        self.events
            .live()
            .filter(|(_, event)| event.resource == resource)
            .map(|(handle, _)| handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventStatus, Origin};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn resource() -> Resource {
        Resource {
            name: "Room 1".into(),
            base_price: Some(5000),
            base_min_stay: 1,
            currency: "EUR".into(),
        }
    }

    #[test]
    fn adopt_returns_existing_handle_for_known_id() {
        let mut arena: Arena<Resource> = Arena::default();
        let first = arena.adopt(7, resource());
        let second = arena.adopt(7, resource());
        assert_eq!(first, second);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.key(first), Key::Stored(7));
    }

    #[test]
    fn removing_new_record_makes_it_transient() {
        let mut arena: Arena<Resource> = Arena::default();
        let h = arena.insert(resource());
        arena.remove(h);
        assert_eq!(arena.state(h), EntityState::Transient);
        assert_eq!(arena.key(h), Key::Pending(0));
    }

    #[test]
    fn changed_fields_track_only_managed_records() {
        let mut arena: Arena<Resource> = Arena::default();
        let stored = arena.adopt(1, resource());
        let fresh = arena.insert(resource());
        arena.get_mut(stored).base_price = Some(6000);
        arena.get_mut(fresh).base_price = Some(6000);
        assert_eq!(arena.changed_fields(stored), vec!["base_price"]);
        assert!(arena.changed_fields(fresh).is_empty());
    }

    #[test]
    fn stored_keys_sort_before_pending_keys() {
        assert!(Key::Stored(999) < Key::Pending(0));
        assert!(Key::Pending(1) < Key::Pending(2));
        assert_eq!(Key::Pending(3).to_string(), "new-3");
    }

    #[test]
    fn removing_reservation_cascades_to_events_and_links() {
        let mut session = Session::new(now());
        let room = session.resources.adopt(1, resource());
        let reservation = session.reservations.adopt(1, Reservation::new(Origin::Local, "Ann"));
        let mut event = CalendarEvent::new(
            room,
            now(),
            now() + chrono::Duration::days(2),
            EventStatus::Confirmed,
        );
        event.reservation = Some(reservation);
        let event = session.events.adopt(10, event);
        let link = session.links.adopt(
            100,
            SyncLink {
                event,
                mapping: None,
                external_booking_id: None,
                status: crate::model::LinkStatus::Active,
                last_seen_at: now(),
                origin_link: None,
            },
        );

        session.remove_reservation(reservation);

        assert_eq!(session.reservations.state(reservation), EntityState::Removed);
        assert_eq!(session.events.state(event), EntityState::Removed);
        assert_eq!(session.links.state(link), EntityState::Removed);
        assert_eq!(session.tracked_links_of(event), vec![link]);
        assert!(session.live_links_of(event).is_empty());
    }

    #[test]
    fn register_for_persist_schedules_staged_records() {
        let mut session = Session::new(now());
        let h = session.resources.stage(resource());
        assert_eq!(session.resources.state(h), EntityState::Transient);
        session.resources.register_for_persist(h);
        assert_eq!(session.resources.state(h), EntityState::New);
    }
}
