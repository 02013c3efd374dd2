//! Job lookups that see both committed rows and rows created earlier in the
//! same transaction.
//!
//! Every lookup scans the session first. Committed rows found through the
//! transaction are adopted into the session, so the caller always gets a
//! `Handle` and mutates in-flight and stored jobs the same way.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::compress::DateSpan;
use crate::db::{self, Tx};
use crate::model::{
    DispatchState, ExternalMapping, JobStatus, PriceRule, PushIntent, PushJob, RateDelivery,
    RateQueueJob, Resource, SyncLink,
};
use crate::session::{EntityState, Handle, Session};

fn is_open(status: JobStatus) -> bool {
    matches!(status, JobStatus::Pending | JobStatus::Processing)
}

fn cancel(state: &mut DispatchState, reason: &str) {
    state.status = JobStatus::Cancelled;
    state.locked_by = None;
    state.locked_at = None;
    state.failed_reason = Some(reason.to_string());
}

/// What `enqueue_push` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(Handle<PushJob>),
    Merged(Handle<PushJob>),
}

pub struct JobRepository<'a, 'c> {
    pub session: &'a mut Session,
    tx: &'a mut Tx<'c>,
}

impl<'a, 'c> JobRepository<'a, 'c> {
    pub fn new(session: &'a mut Session, tx: &'a mut Tx<'c>) -> Self {
        Self { session, tx }
    }

    /// The pending or processing push job for `(link, intent)`.
    pub async fn open_push_job(
        &mut self,
        link: Handle<SyncLink>,
        intent: PushIntent,
    ) -> Result<Option<Handle<PushJob>>> {
        let in_flight = self.session.push_jobs.live().find(|(_, job)| {
            job.link == Some(link) && job.intent == intent && is_open(job.dispatch.status)
        });
        if let Some((handle, _)) = in_flight {
            return Ok(Some(handle));
        }

        let Some(link_id) = self.session.links.id(link) else {
            return Ok(None);
        };
        let Some(row) = db::fetch_open_push_job(self.tx, link_id, intent.as_str()).await? else {
            return Ok(None);
        };
        let handle = self.session.adopt_push_job_row(row)?;
        // A session copy may already have moved the job out of the queue.
        let job = self.session.push_jobs.get(handle);
        let still_open = self.session.push_jobs.is_live(handle)
            && job.link == Some(link)
            && is_open(job.dispatch.status);
        Ok(still_open.then_some(handle))
    }

    /// All open push jobs of a link, any intent.
    pub async fn open_push_jobs(&mut self, link: Handle<SyncLink>) -> Result<Vec<Handle<PushJob>>> {
        let mut jobs = Vec::new();
        for intent in [PushIntent::Upsert, PushIntent::Delete] {
            if let Some(job) = self.open_push_job(link, intent).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Remote booking id of a link, falling back to the ids recorded on its
    /// push jobs.
    pub async fn external_id(&mut self, link: Handle<SyncLink>) -> Result<Option<String>> {
        let current = self.session.links.get(link).external_booking_id.clone();
        if let Some(id) = current.filter(|id| !id.is_empty()) {
            return Ok(Some(id));
        }

        let mut in_flight: Vec<_> = self
            .session
            .push_jobs
            .handles()
            .filter(|h| self.session.push_jobs.get(*h).link == Some(link))
            .filter_map(|h| {
                let recorded = self.session.push_jobs.get(h).external_id_at_creation.clone()?;
                (!recorded.is_empty()).then_some((self.session.push_jobs.key(h), recorded))
            })
            .collect();
        in_flight.sort();
        if let Some((_, id)) = in_flight.pop() {
            return Ok(Some(id));
        }

        match self.session.links.id(link) {
            Some(link_id) => db::latest_external_id_for_link(self.tx, link_id).await,
            None => Ok(None),
        }
    }

    /// Merge into the open job for `(link, intent)` or create one.
    ///
    /// Merging refreshes the payload and puts the job back in the queue, which
    /// also drops a dispatcher's claim on a job that was mid-flight.
    pub async fn enqueue_push(
        &mut self,
        link: Handle<SyncLink>,
        endpoint: &str,
        intent: PushIntent,
        payload: Value,
        external_id: Option<String>,
    ) -> Result<Enqueued> {
        let now = self.session.now();
        if let Some(handle) = self.open_push_job(link, intent).await? {
            let job = self.session.push_jobs.get_mut(handle);
            job.endpoint = endpoint.to_string();
            job.payload = payload;
            if external_id.is_some() {
                job.external_id_at_creation = external_id;
            }
            let changed = self.session.push_jobs.changed_fields(handle);
            let job = self.session.push_jobs.get_mut(handle);
            if job.dispatch.status == JobStatus::Processing || !changed.is_empty() {
                job.dispatch.requeue(now);
                job.updated_at = now;
            }
            debug!(job = %self.session.push_jobs.key(handle), intent = intent.as_str(), "merged push");
            return Ok(Enqueued::Merged(handle));
        }

        let handle = self.session.push_jobs.insert(PushJob {
            link: Some(link),
            endpoint: endpoint.to_string(),
            intent,
            dispatch: DispatchState::pending(now),
            dedupe_key: String::new(),
            external_id_at_creation: external_id,
            payload,
            created_at: now,
            updated_at: now,
        });
        debug!(link = %self.session.links.key(link), intent = intent.as_str(), "created push");
        Ok(Enqueued::Created(handle))
    }

    pub fn cancel_push_job(&mut self, handle: Handle<PushJob>, reason: &str) {
        let now = self.session.now();
        let job = self.session.push_jobs.get_mut(handle);
        cancel(&mut job.dispatch, reason);
        job.updated_at = now;
    }

    /// Pending rate jobs for the same target and winner whose span overlaps
    /// or touches `span`, oldest first.
    pub async fn mergeable_rate_jobs(
        &mut self,
        resource: Handle<Resource>,
        endpoint: &str,
        winner: Option<Handle<PriceRule>>,
        span: DateSpan,
    ) -> Result<Vec<Handle<RateQueueJob>>> {
        let mergeable = |session: &Session, handle: Handle<RateQueueJob>| {
            let job = session.rate_jobs.get(handle);
            session.rate_jobs.is_live(handle)
                && job.resource == resource
                && job.endpoint == endpoint
                && job.price_rule == winner
                && job.dispatch.status == JobStatus::Pending
                && DateSpan::new(job.start, job.end).touches(&span)
        };

        let session: &Session = self.session;
        let mut found: Vec<_> = session
            .rate_jobs
            .handles()
            .filter(|h| mergeable(session, *h))
            .collect();

        let Some(resource_id) = self.session.resources.id(resource) else {
            return Ok(found);
        };
        let rule_id = match winner {
            Some(rule) => match self.session.price_rules.id(rule) {
                Some(id) => Some(id),
                // A rule that was never stored has no committed jobs.
                None => return Ok(found),
            },
            None => None,
        };
        let rows = db::fetch_mergeable_rate_jobs(
            self.tx, resource_id, endpoint, rule_id, span.start, span.end,
        )
        .await?;
        for row in rows {
            let handle = self.session.adopt_rate_job_row(self.tx, row).await?;
            if !found.contains(&handle) && mergeable(self.session, handle) {
                found.push(handle);
            }
        }
        found.sort_by_key(|h| self.session.rate_jobs.key(*h));
        Ok(found)
    }

    pub fn create_rate_job(&mut self, job: RateQueueJob) -> Handle<RateQueueJob> {
        self.session.rate_jobs.insert(job)
    }

    /// Pending rate jobs of a target overlapping `span`, any winner.
    pub async fn overlapping_rate_jobs(
        &mut self,
        resource: Handle<Resource>,
        endpoint: &str,
        span: DateSpan,
    ) -> Result<Vec<Handle<RateQueueJob>>> {
        if let Some(resource_id) = self.session.resources.id(resource) {
            let rows = db::fetch_pending_rate_jobs_overlapping(
                self.tx, resource_id, endpoint, span.start, span.end,
            )
            .await?;
            for row in rows {
                self.session.adopt_rate_job_row(self.tx, row).await?;
            }
        }
        let session: &Session = self.session;
        let mut found: Vec<_> = session
            .rate_jobs
            .live()
            .filter(|(_, job)| {
                job.resource == resource
                    && job.endpoint == endpoint
                    && job.dispatch.status == JobStatus::Pending
                    && DateSpan::new(job.start, job.end).overlaps(&span)
            })
            .map(|(h, _)| h)
            .collect();
        found.sort_by_key(|h| session.rate_jobs.key(*h));
        Ok(found)
    }

    /// Make sure `job` has a delivery for `mapping`. Returns `true` when one
    /// was created. When the job changed, an existing delivery gets the new
    /// `effective_at` and goes back in the queue.
    pub async fn ensure_delivery(
        &mut self,
        job: Handle<RateQueueJob>,
        mapping: Handle<ExternalMapping>,
        effective_at: DateTime<Utc>,
        job_changed: bool,
    ) -> Result<bool> {
        if let Some(handle) = self.find_delivery(job, mapping).await? {
            if job_changed {
                let delivery = self.session.deliveries.get_mut(handle);
                delivery.effective_at = effective_at;
                if delivery.dispatch.status != JobStatus::Pending || delivery.dispatch.locked_by.is_some() {
                    delivery.dispatch.requeue(effective_at);
                }
            }
            return Ok(false);
        }
        self.session.deliveries.insert(RateDelivery {
            job,
            mapping,
            dispatch: DispatchState::pending(effective_at),
            effective_at,
        });
        Ok(true)
    }

    async fn find_delivery(
        &mut self,
        job: Handle<RateQueueJob>,
        mapping: Handle<ExternalMapping>,
    ) -> Result<Option<Handle<RateDelivery>>> {
        let in_flight = self
            .session
            .deliveries
            .live()
            .find(|(_, d)| d.job == job && d.mapping == mapping);
        if let Some((handle, _)) = in_flight {
            return Ok(Some(handle));
        }
        let (Some(job_id), Some(mapping_id)) =
            (self.session.rate_jobs.id(job), self.session.mappings.id(mapping))
        else {
            return Ok(None);
        };
        match db::fetch_delivery(self.tx, job_id, mapping_id).await? {
            Some(row) => {
                let handle = self.session.adopt_delivery_row(row, job, mapping)?;
                Ok(self.session.deliveries.is_live(handle).then_some(handle))
            }
            None => Ok(None),
        }
    }

    /// Cancel a rate job that was folded into another one, along with its
    /// unfinished deliveries, committed or in-flight.
    pub async fn cancel_rate_job(&mut self, job: Handle<RateQueueJob>, reason: &str) -> Result<()> {
        if let Some(job_id) = self.session.rate_jobs.id(job) {
            for row in db::fetch_deliveries_for_job(self.tx, job_id).await? {
                let mapping = self.session.load_mapping(self.tx, row.mapping_id).await?;
                self.session.adopt_delivery_row(row, job, mapping)?;
            }
        }

        let deliveries: Vec<_> = self
            .session
            .deliveries
            .live()
            .filter(|(_, d)| d.job == job && !d.dispatch.status.is_terminal())
            .map(|(h, _)| h)
            .collect();

        // Never written: just drop it.
        if self.session.rate_jobs.state(job) == EntityState::New {
            for handle in deliveries {
                self.session.deliveries.remove(handle);
            }
            self.session.rate_jobs.remove(job);
            return Ok(());
        }

        let now = self.session.now();
        let rate_job = self.session.rate_jobs.get_mut(job);
        cancel(&mut rate_job.dispatch, reason);
        rate_job.updated_at = now;
        for handle in deliveries {
            cancel(&mut self.session.deliveries.get_mut(handle).dispatch, reason);
        }
        Ok(())
    }

    pub async fn has_open_push_jobs(&mut self, link: Handle<SyncLink>) -> Result<bool> {
        Ok(!self.open_push_jobs(link).await?.is_empty())
    }
}
