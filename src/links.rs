//! Link reconciliation: one `SyncLink` per active mapping of an event's
//! resource, exactly one of them the root.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

use crate::model::{CalendarEvent, ExternalMapping, LinkStatus, SyncLink};
use crate::session::{ChangeSet, Handle, Session};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub moved: usize,
    pub rerooted: usize,
    pub removed: usize,
}

impl ReconcileStats {
    fn absorb(&mut self, other: ReconcileStats) {
        self.created += other.created;
        self.moved += other.moved;
        self.rerooted += other.rerooted;
        self.removed += other.removed;
    }
}

/// Live events whose links may need work after `changes`.
///
/// Any mapping change (insert, delete, activation, principal flag, resource)
/// pulls in every loaded event of the affected resources.
pub fn touched_events(session: &Session, changes: &ChangeSet) -> BTreeSet<Handle<CalendarEvent>> {
    let mut events: BTreeSet<_> = changes.events.touched().collect();
    events.extend(changes.dirty_events());
    events.extend(changes.links.touched().map(|l| session.links.get(l).event));

    let mut resources = BTreeSet::new();
    for mapping in changes.mappings.touched() {
        resources.insert(session.mappings.get(mapping).resource);
        if let Some(original) = session.mappings.original(mapping) {
            resources.insert(original.resource);
        }
    }
    for resource in resources {
        events.extend(session.events_of_resource(resource));
    }

    events.retain(|event| session.events.is_live(*event));
    events
}

#[instrument(skip_all)]
pub fn reconcile_all(
    session: &mut Session,
    events: impl IntoIterator<Item = Handle<CalendarEvent>>,
) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    for event in events {
        stats.absorb(reconcile_event(session, event));
    }
    if stats != ReconcileStats::default() {
        debug!(?stats, "links reconciled");
    }
    stats
}

/// Bring the links of one event in line with its resource's active mappings.
pub fn reconcile_event(session: &mut Session, event: Handle<CalendarEvent>) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    if !session.events.is_live(event) {
        return stats;
    }
    let resource = session.events.get(event).resource;
    let active = session.active_mappings(resource);

    let mut links = session.live_links_of(event);
    links.sort_by_key(|l| session.links.key(*l));

    let mut by_mapping: BTreeMap<Handle<ExternalMapping>, Handle<SyncLink>> = BTreeMap::new();
    let mut strays = Vec::new();
    for link in links {
        match session.links.get(link).mapping {
            Some(mapping) if active.contains(&mapping) => {
                if by_mapping.contains_key(&mapping) {
                    session.links.remove(link);
                    stats.removed += 1;
                } else {
                    by_mapping.insert(mapping, link);
                }
            }
            // Active mapping of another resource: the event moved.
            Some(mapping)
                if session.mappings.is_live(mapping)
                    && session.mappings.get(mapping).active
                    && session.mappings.get(mapping).resource != resource =>
            {
                strays.push(link);
            }
            _ => {
                session.links.remove(link);
                stats.removed += 1;
            }
        }
    }

    let mut free = active
        .iter()
        .copied()
        .filter(|m| !by_mapping.contains_key(m))
        .collect::<Vec<_>>()
        .into_iter();
    for link in strays {
        match free.next() {
            Some(mapping) => {
                let moved = session.links.get_mut(link);
                moved.mapping = Some(mapping);
                moved.status = if moved.external_booking_id.is_some() {
                    LinkStatus::PendingMove
                } else {
                    LinkStatus::Active
                };
                by_mapping.insert(mapping, link);
                stats.moved += 1;
            }
            None => {
                session.links.remove(link);
                stats.removed += 1;
            }
        }
    }

    let existing: Vec<_> = active
        .iter()
        .filter_map(|m| by_mapping.get(m).map(|l| (*m, *l)))
        .collect();
    let mut root = select_root(session, &existing);

    for mapping in active.iter().copied() {
        if by_mapping.contains_key(&mapping) {
            continue;
        }
        let link = create_link(session, event, mapping, root);
        if root.is_none() {
            root = Some(link);
        }
        by_mapping.insert(mapping, link);
        stats.created += 1;
    }

    let Some(root) = root else {
        return stats;
    };
    for (_, link) in existing {
        let want = (link != root).then_some(root);
        if session.links.get(link).origin_link != want {
            session.links.get_mut(link).origin_link = want;
            stats.rerooted += 1;
        }
    }
    stats
}

fn has_external_id(link: &SyncLink) -> bool {
    link.external_booking_id
        .as_deref()
        .is_some_and(|id| !id.is_empty())
}

/// Candidates are in mapping-key order, so each rule falls back to the lowest key.
fn select_root(
    session: &Session,
    candidates: &[(Handle<ExternalMapping>, Handle<SyncLink>)],
) -> Option<Handle<SyncLink>> {
    let link = |l: Handle<SyncLink>| session.links.get(l);
    let principal = |m: Handle<ExternalMapping>| session.mappings.get(m).principal;

    candidates
        .iter()
        .find(|(_, l)| link(*l).origin_link.is_none())
        .or_else(|| {
            candidates
                .iter()
                .find(|(m, l)| has_external_id(link(*l)) && principal(*m))
        })
        .or_else(|| candidates.iter().find(|(_, l)| has_external_id(link(*l))))
        .or_else(|| candidates.iter().find(|(m, _)| principal(*m)))
        .or_else(|| candidates.first())
        .map(|(_, l)| *l)
}

fn create_link(
    session: &mut Session,
    event: Handle<CalendarEvent>,
    mapping: Handle<ExternalMapping>,
    origin_link: Option<Handle<SyncLink>>,
) -> Handle<SyncLink> {
    let link = session.links.stage(SyncLink {
        event,
        mapping: Some(mapping),
        external_booking_id: None,
        status: LinkStatus::Active,
        last_seen_at: session.now(),
        origin_link,
    });
    session.links.register_for_persist(link);
    link
}

/// Check the link invariant for one event.
pub fn verify_links(session: &Session, event: Handle<CalendarEvent>) -> Result<()> {
    let key = session.events.key(event);
    let active = session.active_mappings(session.events.get(event).resource);
    let links = session.live_links_of(event);

    let mut seen = BTreeSet::new();
    for link in &links {
        match session.links.get(*link).mapping {
            Some(mapping) if active.contains(&mapping) => {
                if !seen.insert(mapping) {
                    bail!("event {key} has two links for mapping {}", session.mappings.key(mapping));
                }
            }
            _ => bail!(
                "event {key} keeps link {} outside its active mappings",
                session.links.key(*link)
            ),
        }
    }
    if seen.len() != active.len() {
        bail!("event {key} has {} links for {} active mappings", seen.len(), active.len());
    }

    let roots: Vec<_> = links
        .iter()
        .filter(|l| session.links.get(**l).origin_link.is_none())
        .collect();
    if !links.is_empty() && roots.len() != 1 {
        bail!("event {key} has {} root links", roots.len());
    }
    if let Some(root) = roots.first() {
        for link in &links {
            if link != *root && session.links.get(*link).origin_link != Some(**root) {
                bail!("link {} does not point at the root", session.links.key(*link));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventStatus, Resource};
    use crate::session::{capture_changes, EntityState};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
    }

    fn room(session: &mut Session, id: i64) -> Handle<crate::model::Resource> {
        session.resources.adopt(
            id,
            Resource {
                name: format!("Room {id}"),
                base_price: None,
                base_min_stay: 1,
                currency: "EUR".into(),
            },
        )
    }

    fn mapping(
        session: &mut Session,
        id: i64,
        resource: Handle<crate::model::Resource>,
        principal: bool,
    ) -> Handle<ExternalMapping> {
        session.mappings.adopt(
            id,
            ExternalMapping {
                resource,
                external_room_id: format!("room-{id}"),
                external_property_id: "prop".into(),
                active: true,
                principal,
            },
        )
    }

    fn stored_link(
        session: &mut Session,
        id: i64,
        event: Handle<CalendarEvent>,
        mapping: Handle<ExternalMapping>,
        external: Option<&str>,
    ) -> Handle<SyncLink> {
        session.links.adopt(
            id,
            SyncLink {
                event,
                mapping: Some(mapping),
                external_booking_id: external.map(str::to_string),
                status: LinkStatus::Active,
                last_seen_at: now(),
                origin_link: None,
            },
        )
    }

    fn stay(resource: Handle<crate::model::Resource>) -> CalendarEvent {
        CalendarEvent::new(resource, now(), now() + Duration::days(3), EventStatus::Confirmed)
    }

    #[test]
    fn new_event_gets_one_link_per_active_mapping() {
        let mut session = Session::new(now());
        let r = room(&mut session, 1);
        let m2 = mapping(&mut session, 2, r, false);
        let m1 = mapping(&mut session, 1, r, false);
        let event = session.events.insert(stay(r));

        let stats = reconcile_event(&mut session, event);

        assert_eq!(stats.created, 2);
        verify_links(&session, event).unwrap();
        let links = session.live_links_of(event);
        let root = links
            .iter()
            .find(|l| session.links.get(**l).origin_link.is_none())
            .unwrap();
        assert_eq!(session.links.get(*root).mapping, Some(m1));
        assert!(links.iter().any(|l| session.links.get(*l).mapping == Some(m2)));
        assert!(links
            .iter()
            .all(|l| session.links.state(*l) == EntityState::New));
    }

    #[test]
    fn reconciling_twice_changes_nothing() {
        let mut session = Session::new(now());
        let r = room(&mut session, 1);
        mapping(&mut session, 1, r, false);
        mapping(&mut session, 2, r, true);
        let event = session.events.insert(stay(r));

        reconcile_event(&mut session, event);
        let again = reconcile_event(&mut session, event);

        assert_eq!(again, ReconcileStats::default());
        assert_eq!(session.live_links_of(event).len(), 2);
    }

    #[test]
    fn root_prefers_external_id_on_principal_mapping() {
        let mut session = Session::new(now());
        let r = room(&mut session, 1);
        let m1 = mapping(&mut session, 1, r, false);
        let m2 = mapping(&mut session, 2, r, true);
        let m3 = mapping(&mut session, 3, r, false);
        let event = session.events.adopt(10, stay(r));
        let dead_root = stored_link(&mut session, 99, event, m1, None);
        let a = stored_link(&mut session, 100, event, m1, Some("x-1"));
        let b = stored_link(&mut session, 101, event, m2, Some("x-2"));
        let c = stored_link(&mut session, 102, event, m3, None);
        // The old root is gone; every survivor still points at it.
        for link in [a, b, c] {
            session.links.patch_loaded(link, |l| l.origin_link = Some(dead_root));
        }
        session.links.remove(dead_root);

        reconcile_event(&mut session, event);

        verify_links(&session, event).unwrap();
        assert_eq!(session.links.get(b).origin_link, None);
        assert_eq!(session.links.get(a).origin_link, Some(b));
        assert_eq!(session.links.get(c).origin_link, Some(b));
    }

    #[test]
    fn deactivated_mapping_loses_its_link_and_survivors_reroot() {
        let mut session = Session::new(now());
        let r = room(&mut session, 1);
        let m1 = mapping(&mut session, 1, r, false);
        let m2 = mapping(&mut session, 2, r, false);
        let event = session.events.adopt(10, stay(r));
        let root = stored_link(&mut session, 100, event, m1, Some("x-1"));
        let child = stored_link(&mut session, 101, event, m2, Some("x-2"));
        session.links.patch_loaded(child, |l| l.origin_link = Some(root));

        session.mappings.get_mut(m1).active = false;
        let events = touched_events(&session, &capture_changes(&session));
        assert!(events.contains(&event));
        let stats = reconcile_all(&mut session, events);

        assert_eq!(stats.removed, 1);
        assert_eq!(session.links.state(root), EntityState::Removed);
        assert_eq!(session.links.get(child).origin_link, None);
        verify_links(&session, event).unwrap();
    }

    #[test]
    fn moved_event_carries_its_links_to_the_new_resource() {
        let mut session = Session::new(now());
        let old_room = room(&mut session, 1);
        let new_room = room(&mut session, 2);
        let old_mapping = mapping(&mut session, 1, old_room, false);
        let new_mapping = mapping(&mut session, 2, new_room, false);
        let event = session.events.adopt(10, stay(old_room));
        let link = stored_link(&mut session, 100, event, old_mapping, Some("x-1"));

        session.events.get_mut(event).resource = new_room;
        reconcile_event(&mut session, event);

        let moved = session.links.get(link);
        assert_eq!(moved.mapping, Some(new_mapping));
        assert_eq!(moved.status, LinkStatus::PendingMove);
        verify_links(&session, event).unwrap();
    }

    #[test]
    fn resource_without_mappings_has_no_links() {
        let mut session = Session::new(now());
        let r = room(&mut session, 1);
        let event = session.events.insert(stay(r));
        assert_eq!(reconcile_event(&mut session, event), ReconcileStats::default());
        verify_links(&session, event).unwrap();
    }
}
