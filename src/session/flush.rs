use anyhow::{anyhow, Result};
use tracing::{debug, instrument};

use super::{Arena, Entity, EntityState, Handle, Session};
use crate::db::{
    self,
    model::{
        DeliveryRow, DispatchRow, EventRow, LinkRow, MappingRow, PriceRuleRow, PushJobRow,
        RateJobRow, ReservationRow, ResourceRow,
    },
    Table, Tx,
};
use crate::model::{
    CalendarEvent, DispatchState, ExternalMapping, PriceRule, PushJob, RateDelivery,
    RateQueueJob, Reservation, Resource, SyncLink,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

fn stored<T: Entity>(arena: &Arena<T>, handle: Handle<T>) -> Result<i64> {
    arena.id(handle).ok_or_else(|| {
        anyhow!(
            "{} {} is referenced before it was stored",
            T::KIND,
            arena.key(handle)
        )
    })
}

fn dispatch_row(state: &DispatchState) -> DispatchRow {
    DispatchRow {
        status: state.status.as_str().to_string(),
        retry_count: state.retry_count,
        next_run_at: state.next_run_at,
        locked_by: state.locked_by.clone(),
        locked_at: state.locked_at,
        last_http_code: state.last_http_code,
        last_request_raw: state.last_request_raw.clone(),
        last_response_raw: state.last_response_raw.clone(),
        failed_reason: state.failed_reason.clone(),
    }
}

/// Insert new and update changed records of one arena, in arena order.
macro_rules! write_pending {
    ($session:ident, $tx:ident, $stats:ident, $arena:ident, $row:ident, $save:path) => {{
        let handles: Vec<_> = $session.$arena.handles().collect();
        for handle in handles {
            match $session.$arena.state(handle) {
                EntityState::New => {
                    let row = $session.$row(handle)?;
                    let id = $save($tx, None, &row).await?;
                    $session.$arena.mark_stored(handle, id);
                    $stats.inserted += 1;
                }
                EntityState::Managed if !$session.$arena.changed_fields(handle).is_empty() => {
                    let row = $session.$row(handle)?;
                    $save($tx, $session.$arena.id(handle), &row).await?;
                    $session.$arena.mark_synced(handle);
                    $stats.updated += 1;
                }
                _ => {}
            }
        }
    }};
}

macro_rules! delete_removed {
    ($session:ident, $tx:ident, $stats:ident, $arena:ident, $table:expr) => {{
        let handles: Vec<_> = $session.$arena.handles().collect();
        for handle in handles {
            if $session.$arena.state(handle) == EntityState::Removed {
                if let Some(id) = $session.$arena.id(handle) {
                    db::delete_row($tx, $table, id).await?;
                }
                $session.$arena.mark_deleted(handle);
                $stats.deleted += 1;
            }
        }
    }};
}

impl Session {
    /// Write every pending change inside `tx`. Inserts and updates go parents
    /// first, deletes go children first; new ids are assigned as rows land.
    #[instrument(skip_all)]
    pub async fn flush(&mut self, tx: &mut Tx<'_>) -> Result<FlushStats> {
        let mut stats = FlushStats::default();
        let session = self;

        write_pending!(session, tx, stats, resources, resource_row, db::save_resource);
        write_pending!(session, tx, stats, mappings, mapping_row, db::save_mapping);
        write_pending!(session, tx, stats, reservations, reservation_row, db::save_reservation);
        write_pending!(session, tx, stats, events, event_row, db::save_event);
        session.write_links(tx, &mut stats).await?;
        write_pending!(session, tx, stats, price_rules, price_rule_row, db::save_price_rule);
        session.assign_dedupe_keys()?;
        write_pending!(session, tx, stats, push_jobs, push_job_row, db::save_push_job);
        write_pending!(session, tx, stats, rate_jobs, rate_job_row, db::save_rate_job);
        write_pending!(session, tx, stats, deliveries, delivery_row, db::save_delivery);

        delete_removed!(session, tx, stats, deliveries, Table::RateDeliveries);
        delete_removed!(session, tx, stats, rate_jobs, Table::RateQueueJobs);
        delete_removed!(session, tx, stats, push_jobs, Table::PushJobs);
        delete_removed!(session, tx, stats, price_rules, Table::PriceRules);
        delete_removed!(session, tx, stats, links, Table::SyncLinks);
        delete_removed!(session, tx, stats, events, Table::CalendarEvents);
        delete_removed!(session, tx, stats, reservations, Table::Reservations);
        delete_removed!(session, tx, stats, mappings, Table::ExternalMappings);
        delete_removed!(session, tx, stats, resources, Table::Resources);

        debug!(?stats, "session flushed");
        Ok(stats)
    }

    /// Links point at each other through `origin_link`, so new links land
    /// without an origin first and get it in a second pass.
    async fn write_links(&mut self, tx: &mut Tx<'_>, stats: &mut FlushStats) -> Result<()> {
        let handles: Vec<_> = self.links.handles().collect();
        let mut relink = Vec::new();
        for handle in &handles {
            if self.links.state(*handle) == EntityState::New {
                let mut row = self.link_row(*handle)?;
                row.origin_link_id = None;
                let id = db::save_link(tx, None, &row).await?;
                if self.links.get(*handle).origin_link.is_some() {
                    relink.push(*handle);
                }
                self.links.mark_stored(*handle, id);
                stats.inserted += 1;
            }
        }
        for handle in handles {
            let changed = self.links.state(handle) == EntityState::Managed
                && !self.links.changed_fields(handle).is_empty();
            if changed || relink.contains(&handle) {
                let row = self.link_row(handle)?;
                db::save_link(tx, self.links.id(handle), &row).await?;
                self.links.mark_synced(handle);
                if changed {
                    stats.updated += 1;
                }
            }
        }
        Ok(())
    }

    fn assign_dedupe_keys(&mut self) -> Result<()> {
        let handles: Vec<_> = self.push_jobs.handles().collect();
        for handle in handles {
            if self.push_jobs.state(handle) != EntityState::New
                || !self.push_jobs.get(handle).dedupe_key.is_empty()
            {
                continue;
            }
            let job = self.push_jobs.get(handle);
            let target = match job.link {
                Some(link) => format!("link-{}", stored(&self.links, link)?),
                None => "unlinked".to_string(),
            };
            let key = format!("{}:{}:{}", job.endpoint, job.intent.as_str(), target);
            self.push_jobs.get_mut(handle).dedupe_key = key;
        }
        Ok(())
    }

    fn resource_row(&self, handle: Handle<Resource>) -> Result<ResourceRow> {
        let r = self.resources.get(handle);
        Ok(ResourceRow {
            id: self.resources.id(handle).unwrap_or_default(),
            name: r.name.clone(),
            base_price: r.base_price,
            base_min_stay: r.base_min_stay,
            currency: r.currency.clone(),
        })
    }

    fn mapping_row(&self, handle: Handle<ExternalMapping>) -> Result<MappingRow> {
        let m = self.mappings.get(handle);
        Ok(MappingRow {
            id: self.mappings.id(handle).unwrap_or_default(),
            resource_id: stored(&self.resources, m.resource)?,
            external_room_id: m.external_room_id.clone(),
            external_property_id: m.external_property_id.clone(),
            active: m.active,
            principal: m.principal,
        })
    }

    fn reservation_row(&self, handle: Handle<Reservation>) -> Result<ReservationRow> {
        let r = self.reservations.get(handle);
        Ok(ReservationRow {
            id: self.reservations.id(handle).unwrap_or_default(),
            origin: r.origin.as_str().to_string(),
            data_locked: r.data_locked,
            guest_name: r.guest_name.clone(),
            guest_email: r.guest_email.clone(),
            guest_phone: r.guest_phone.clone(),
            comment: r.comment.clone(),
            internal_note: r.internal_note.clone(),
            total_price: r.total_price,
            total_paid: r.total_paid,
            guest_count: r.guest_count,
            event_count: r.event_count,
            payment_status: r.payment_status.as_str().to_string(),
            arrival_at: r.arrival_at,
            departure_at: r.departure_at,
        })
    }

    fn event_row(&self, handle: Handle<CalendarEvent>) -> Result<EventRow> {
        let e = self.events.get(handle);
        Ok(EventRow {
            id: self.events.id(handle).unwrap_or_default(),
            resource_id: stored(&self.resources, e.resource)?,
            reservation_id: e
                .reservation
                .map(|r| stored(&self.reservations, r))
                .transpose()?,
            start_at: e.start_at,
            end_at: e.end_at,
            status: e.status.as_str().to_string(),
            payment_status: e.payment_status.as_str().to_string(),
            origin: e.origin.as_str().to_string(),
            adults: e.adults,
            children: e.children,
            price_total: e.price_total,
            paid_amount: e.paid_amount,
            title: e.title.clone(),
        })
    }

    fn link_row(&self, handle: Handle<SyncLink>) -> Result<LinkRow> {
        let l = self.links.get(handle);
        Ok(LinkRow {
            id: self.links.id(handle).unwrap_or_default(),
            event_id: stored(&self.events, l.event)?,
            mapping_id: l.mapping.map(|m| stored(&self.mappings, m)).transpose()?,
            external_booking_id: l.external_booking_id.clone(),
            status: l.status.as_str().to_string(),
            last_seen_at: l.last_seen_at,
            origin_link_id: l.origin_link.and_then(|o| self.links.id(o)),
        })
    }

    fn price_rule_row(&self, handle: Handle<PriceRule>) -> Result<PriceRuleRow> {
        let p = self.price_rules.get(handle);
        Ok(PriceRuleRow {
            id: self.price_rules.id(handle).unwrap_or_default(),
            resource_id: stored(&self.resources, p.resource)?,
            start_date: p.start,
            end_date: p.end,
            price: p.price,
            min_stay: p.min_stay,
            currency: p.currency.clone(),
            important: p.important,
            weight: p.weight,
            active: p.active,
        })
    }

    fn push_job_row(&self, handle: Handle<PushJob>) -> Result<PushJobRow> {
        let j = self.push_jobs.get(handle);
        Ok(PushJobRow {
            id: self.push_jobs.id(handle).unwrap_or_default(),
            // A link deleted in this flush is nulled by the foreign key.
            link_id: j.link.and_then(|l| self.links.id(l)),
            endpoint: j.endpoint.clone(),
            intent: j.intent.as_str().to_string(),
            dispatch: dispatch_row(&j.dispatch),
            dedupe_key: j.dedupe_key.clone(),
            external_id_at_creation: j.external_id_at_creation.clone(),
            payload: serde_json::to_string(&j.payload)?,
            created_at: j.created_at,
            updated_at: j.updated_at,
        })
    }

    fn rate_job_row(&self, handle: Handle<RateQueueJob>) -> Result<RateJobRow> {
        let j = self.rate_jobs.get(handle);
        Ok(RateJobRow {
            id: self.rate_jobs.id(handle).unwrap_or_default(),
            resource_id: stored(&self.resources, j.resource)?,
            endpoint: j.endpoint.clone(),
            start_date: j.start,
            end_date: j.end,
            price: j.price,
            min_stay: j.min_stay,
            currency: j.currency.clone(),
            price_rule_id: j.price_rule.and_then(|r| self.price_rules.id(r)),
            dispatch: dispatch_row(&j.dispatch),
            created_at: j.created_at,
            updated_at: j.updated_at,
        })
    }

    fn delivery_row(&self, handle: Handle<RateDelivery>) -> Result<DeliveryRow> {
        let d = self.deliveries.get(handle);
        Ok(DeliveryRow {
            id: self.deliveries.id(handle).unwrap_or_default(),
            job_id: stored(&self.rate_jobs, d.job)?,
            mapping_id: stored(&self.mappings, d.mapping)?,
            dispatch: dispatch_row(&d.dispatch),
            effective_at: d.effective_at,
        })
    }
}
