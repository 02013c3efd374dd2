use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use tracing::instrument;

use super::{Handle, Session};
use crate::db::{
    self,
    model::{DeliveryRow, DispatchRow, EventRow, MappingRow, PriceRuleRow, PushJobRow, RateJobRow},
    Tx,
};
use crate::model::{
    CalendarEvent, DispatchState, EventStatus, ExternalMapping, JobStatus, LinkStatus, Origin,
    PaymentStatus, PriceRule, PushIntent, PushJob, RateDelivery, RateQueueJob, Reservation,
    Resource, SyncLink,
};

fn parse<T>(value: &str, parser: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parser(value).ok_or_else(|| anyhow!("unknown {} '{}'", what, value))
}

fn dispatch_state(row: DispatchRow) -> Result<DispatchState> {
    Ok(DispatchState {
        status: parse(&row.status, JobStatus::parse, "job status")?,
        retry_count: row.retry_count,
        next_run_at: row.next_run_at,
        locked_by: row.locked_by,
        locked_at: row.locked_at,
        last_http_code: row.last_http_code,
        last_request_raw: row.last_request_raw,
        last_response_raw: row.last_response_raw,
        failed_reason: row.failed_reason,
    })
}

impl Session {
    /// Load a resource with all of its external mappings.
    #[instrument(skip_all, fields(id = id))]
    pub async fn load_resource(&mut self, tx: &mut Tx<'_>, id: i64) -> Result<Handle<Resource>> {
        if let Some(handle) = self.resources.handle_of(id) {
            return Ok(handle);
        }
        let row = db::fetch_resource(tx, id)
            .await?
            .ok_or_else(|| anyhow!("resource {} not found", id))?;
        let handle = self.resources.adopt(
            row.id,
            Resource {
                name: row.name,
                base_price: row.base_price,
                base_min_stay: row.base_min_stay,
                currency: row.currency,
            },
        );
        for mapping in db::fetch_mappings_for_resource(tx, id).await? {
            self.adopt_mapping_row(handle, mapping);
        }
        Ok(handle)
    }

    fn adopt_mapping_row(
        &mut self,
        resource: Handle<Resource>,
        row: MappingRow,
    ) -> Handle<ExternalMapping> {
        self.mappings.adopt(
            row.id,
            ExternalMapping {
                resource,
                external_room_id: row.external_room_id,
                external_property_id: row.external_property_id,
                active: row.active,
                principal: row.principal,
            },
        )
    }

    pub async fn load_mapping(&mut self, tx: &mut Tx<'_>, id: i64) -> Result<Handle<ExternalMapping>> {
        if let Some(handle) = self.mappings.handle_of(id) {
            return Ok(handle);
        }
        let row = db::fetch_mapping(tx, id)
            .await?
            .ok_or_else(|| anyhow!("external mapping {} not found", id))?;
        self.load_resource(tx, row.resource_id).await?;
        self.mappings
            .handle_of(id)
            .ok_or_else(|| anyhow!("external mapping {} vanished while loading", id))
    }

    /// Load a reservation together with all of its events and their links.
    #[instrument(skip_all, fields(id = id))]
    pub async fn load_reservation(&mut self, tx: &mut Tx<'_>, id: i64) -> Result<Handle<Reservation>> {
        if let Some(handle) = self.reservations.handle_of(id) {
            return Ok(handle);
        }
        let row = db::fetch_reservation(tx, id)
            .await?
            .ok_or_else(|| anyhow!("reservation {} not found", id))?;
        let handle = self.reservations.adopt(
            row.id,
            Reservation {
                origin: parse(&row.origin, Origin::parse, "origin")?,
                data_locked: row.data_locked,
                guest_name: row.guest_name,
                guest_email: row.guest_email,
                guest_phone: row.guest_phone,
                comment: row.comment,
                internal_note: row.internal_note,
                total_price: row.total_price,
                total_paid: row.total_paid,
                guest_count: row.guest_count,
                event_count: row.event_count,
                payment_status: parse(&row.payment_status, PaymentStatus::parse, "payment status")?,
                arrival_at: row.arrival_at,
                departure_at: row.departure_at,
            },
        );
        for event in db::fetch_events_for_reservation(tx, id).await? {
            if self.events.handle_of(event.id).is_none() {
                self.adopt_event_row(tx, event, Some(handle)).await?;
            }
        }
        Ok(handle)
    }

    /// Load an event with its resource, its links and, when it belongs to a
    /// reservation, the whole reservation.
    #[instrument(skip_all, fields(id = id))]
    pub async fn load_event(&mut self, tx: &mut Tx<'_>, id: i64) -> Result<Handle<CalendarEvent>> {
        if let Some(handle) = self.events.handle_of(id) {
            return Ok(handle);
        }
        let row = db::fetch_event(tx, id)
            .await?
            .ok_or_else(|| anyhow!("calendar event {} not found", id))?;
        match row.reservation_id {
            Some(reservation_id) => {
                self.load_reservation(tx, reservation_id).await?;
                self.events
                    .handle_of(id)
                    .ok_or_else(|| anyhow!("calendar event {} vanished while loading", id))
            }
            None => self.adopt_event_row(tx, row, None).await,
        }
    }

    async fn adopt_event_row(
        &mut self,
        tx: &mut Tx<'_>,
        row: EventRow,
        reservation: Option<Handle<Reservation>>,
    ) -> Result<Handle<CalendarEvent>> {
        let resource = self.load_resource(tx, row.resource_id).await?;
        let event_id = row.id;
        let handle = self.events.adopt(
            event_id,
            CalendarEvent {
                resource,
                reservation,
                start_at: row.start_at,
                end_at: row.end_at,
                status: parse(&row.status, EventStatus::parse, "event status")?,
                payment_status: parse(&row.payment_status, PaymentStatus::parse, "payment status")?,
                origin: parse(&row.origin, Origin::parse, "origin")?,
                adults: row.adults,
                children: row.children,
                price_total: row.price_total,
                paid_amount: row.paid_amount,
                title: row.title,
            },
        );
        self.load_links(tx, handle, event_id).await?;
        Ok(handle)
    }

    async fn load_links(
        &mut self,
        tx: &mut Tx<'_>,
        event: Handle<CalendarEvent>,
        event_id: i64,
    ) -> Result<()> {
        let mut origins = Vec::new();
        for row in db::fetch_links_for_event(tx, event_id).await? {
            let mapping = match row.mapping_id {
                Some(mapping_id) => Some(self.load_mapping(tx, mapping_id).await?),
                None => None,
            };
            let handle = self.links.adopt(
                row.id,
                SyncLink {
                    event,
                    mapping,
                    external_booking_id: row.external_booking_id,
                    status: parse(&row.status, LinkStatus::parse, "link status")?,
                    last_seen_at: row.last_seen_at,
                    origin_link: None,
                },
            );
            origins.push((handle, row.origin_link_id));
        }
        // Origins point at siblings, which only have handles once all are adopted.
        for (handle, origin_id) in origins {
            let origin = origin_id.and_then(|id| self.links.handle_of(id));
            if origin.is_some() {
                self.links.patch_loaded(handle, |link| link.origin_link = origin);
            }
        }
        Ok(())
    }

    /// Load every event that holds a link through `mapping_id`.
    pub async fn load_events_linked_to_mapping(&mut self, tx: &mut Tx<'_>, mapping_id: i64) -> Result<()> {
        for event_id in db::fetch_event_ids_linked_to_mapping(tx, mapping_id).await? {
            self.load_event(tx, event_id).await?;
        }
        Ok(())
    }

    /// Load every committed event of a resource.
    pub async fn load_events_of_resource(&mut self, tx: &mut Tx<'_>, resource_id: i64) -> Result<()> {
        for event_id in db::fetch_event_ids_for_resource(tx, resource_id).await? {
            self.load_event(tx, event_id).await?;
        }
        Ok(())
    }

    pub async fn load_price_rule(&mut self, tx: &mut Tx<'_>, id: i64) -> Result<Handle<PriceRule>> {
        if let Some(handle) = self.price_rules.handle_of(id) {
            return Ok(handle);
        }
        let row = db::fetch_price_rule(tx, id)
            .await?
            .ok_or_else(|| anyhow!("price rule {} not found", id))?;
        self.adopt_price_rule_row(tx, row).await
    }

    async fn adopt_price_rule_row(&mut self, tx: &mut Tx<'_>, row: PriceRuleRow) -> Result<Handle<PriceRule>> {
        let resource = self.load_resource(tx, row.resource_id).await?;
        Ok(self.price_rules.adopt(
            row.id,
            PriceRule {
                resource,
                start: row.start_date,
                end: row.end_date,
                price: row.price,
                min_stay: row.min_stay,
                currency: row.currency,
                important: row.important,
                weight: row.weight,
                active: row.active,
            },
        ))
    }

    /// Pull the committed active rules of a resource that intersect
    /// `[start, end)`. Rules already in the session keep their in-memory state.
    pub async fn load_active_rules(
        &mut self,
        tx: &mut Tx<'_>,
        resource: Handle<Resource>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<()> {
        let Some(resource_id) = self.resources.id(resource) else {
            return Ok(());
        };
        for row in db::fetch_active_rules_overlapping(tx, resource_id, start, end).await? {
            if self.price_rules.handle_of(row.id).is_none() {
                self.adopt_price_rule_row(tx, row).await?;
            }
        }
        Ok(())
    }

    pub(crate) fn adopt_push_job_row(&mut self, row: PushJobRow) -> Result<Handle<PushJob>> {
        if let Some(handle) = self.push_jobs.handle_of(row.id) {
            return Ok(handle);
        }
        let link = row.link_id.and_then(|id| self.links.handle_of(id));
        let payload = serde_json::from_str(&row.payload)
            .with_context(|| format!("push job {} has an unreadable payload", row.id))?;
        Ok(self.push_jobs.adopt(
            row.id,
            PushJob {
                link,
                endpoint: row.endpoint,
                intent: parse(&row.intent, PushIntent::parse, "push intent")?,
                dispatch: dispatch_state(row.dispatch)?,
                dedupe_key: row.dedupe_key,
                external_id_at_creation: row.external_id_at_creation,
                payload,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
        ))
    }

    pub(crate) async fn adopt_rate_job_row(
        &mut self,
        tx: &mut Tx<'_>,
        row: RateJobRow,
    ) -> Result<Handle<RateQueueJob>> {
        if let Some(handle) = self.rate_jobs.handle_of(row.id) {
            return Ok(handle);
        }
        let resource = self.load_resource(tx, row.resource_id).await?;
        let price_rule = match row.price_rule_id {
            Some(rule_id) => Some(self.load_price_rule(tx, rule_id).await?),
            None => None,
        };
        Ok(self.rate_jobs.adopt(
            row.id,
            RateQueueJob {
                resource,
                endpoint: row.endpoint,
                start: row.start_date,
                end: row.end_date,
                price: row.price,
                min_stay: row.min_stay,
                currency: row.currency,
                price_rule,
                dispatch: dispatch_state(row.dispatch)?,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
        ))
    }

    pub(crate) fn adopt_delivery_row(
        &mut self,
        row: DeliveryRow,
        job: Handle<RateQueueJob>,
        mapping: Handle<ExternalMapping>,
    ) -> Result<Handle<RateDelivery>> {
        if let Some(handle) = self.deliveries.handle_of(row.id) {
            return Ok(handle);
        }
        Ok(self.deliveries.adopt(
            row.id,
            RateDelivery {
                job,
                mapping,
                dispatch: dispatch_state(row.dispatch)?,
                effective_at: row.effective_at,
            },
        ))
    }
}
