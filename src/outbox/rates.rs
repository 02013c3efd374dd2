//! Rate change capture: recompute the effective rates of every window a
//! price-rule change touched and fold them into pending rate jobs.
//!
//! Per `(resource, window)`:
//! 1. pending jobs overlapping the window give up their in-window part; jobs
//!    left with nothing become reusable,
//! 2. each compressed range extends an adjacent job with the same winner,
//!    reuses a freed one, or becomes a new job,
//! 3. freed jobs nobody reused are cancelled.
//!
//! Re-running the same change therefore rewrites jobs to the values they
//! already hold and adds no rows.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

use super::jobs::JobRepository;
use crate::compress::{compress, merge_spans, BaseRule, DateSpan, EffectiveRange, SourceId, WeightedRange};
use crate::config::SyncConfig;
use crate::db::Tx;
use crate::model::{DispatchState, ExternalMapping, PriceRule, RateQueueJob, Resource};
use crate::session::{ChangeSet, EntityState, Handle, Key, Session};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateStats {
    pub windows: usize,
    pub ranges: usize,
    pub created: usize,
    pub merged: usize,
    pub cancelled: usize,
    pub deliveries: usize,
}

/// Spans each rule change affects, grouped by resource and merged.
///
/// An active rule contributes its current span, a rule that was active before
/// contributes its old span, so a move between resources becomes a removal on
/// one and an insert on the other.
pub fn affected_windows(session: &Session, changes: &ChangeSet) -> BTreeMap<Handle<Resource>, Vec<DateSpan>> {
    let mut spans: BTreeMap<Handle<Resource>, Vec<DateSpan>> = BTreeMap::new();
    let mut add = |rule: &PriceRule| {
        if rule.active {
            spans
                .entry(rule.resource)
                .or_default()
                .push(DateSpan::new(rule.start, rule.end));
        }
    };

    for handle in &changes.price_rules.inserted {
        add(session.price_rules.get(*handle));
    }
    for update in &changes.price_rules.updated {
        add(session.price_rules.get(update.handle));
        if let Some(original) = session.price_rules.original(update.handle) {
            add(original);
        }
    }
    for handle in &changes.price_rules.deleted {
        let rule = session
            .price_rules
            .original(*handle)
            .unwrap_or_else(|| session.price_rules.get(*handle));
        add(rule);
    }

    spans
        .into_iter()
        .map(|(resource, spans)| (resource, merge_spans(spans)))
        .filter(|(_, spans)| !spans.is_empty())
        .collect()
}

fn base_rule(session: &Session, resource: Handle<Resource>) -> Option<BaseRule> {
    let r = session.resources.get(resource);
    r.base_price.map(|price| BaseRule {
        resource: session.resources.key(resource),
        price,
        min_stay: r.base_min_stay,
        currency: r.currency.clone(),
    })
}

/// Live active rules of `resource` intersecting `window`, keyed for winner lookup.
fn competing_rules(
    session: &Session,
    resource: Handle<Resource>,
    window: DateSpan,
) -> (Vec<WeightedRange>, HashMap<Key, Handle<PriceRule>>) {
    let mut ranges = Vec::new();
    let mut by_key = HashMap::new();
    for (handle, rule) in session.price_rules.live() {
        let span = DateSpan::new(rule.start, rule.end);
        if rule.resource != resource || !rule.active || !span.overlaps(&window) {
            continue;
        }
        let key = session.price_rules.key(handle);
        by_key.insert(key, handle);
        ranges.push(WeightedRange {
            span,
            price: rule.price,
            min_stay: rule.min_stay,
            currency: rule.currency.clone(),
            important: rule.important,
            weight: rule.weight,
            source: SourceId::Rule(key),
        });
    }
    (ranges, by_key)
}

/// Parts of `span` before and after `window`.
fn outside(span: DateSpan, window: DateSpan) -> (Option<DateSpan>, Option<DateSpan>) {
    let left = DateSpan::new(span.start, span.end.min(window.start));
    let right = DateSpan::new(span.start.max(window.end), span.end);
    (
        (!left.is_empty()).then_some(left),
        (!right.is_empty()).then_some(right),
    )
}

fn set_values(session: &mut Session, job: Handle<RateQueueJob>, span: DateSpan, range: &EffectiveRange) {
    let now = session.now();
    let before = session.rate_jobs.get(job).clone();
    let j = session.rate_jobs.get_mut(job);
    j.start = span.start;
    j.end = span.end;
    j.price = range.price;
    j.min_stay = range.min_stay;
    j.currency = range.currency.clone();
    if *j != before {
        j.updated_at = now;
    }
}

fn set_span(session: &mut Session, job: Handle<RateQueueJob>, span: DateSpan) {
    let now = session.now();
    let j = session.rate_jobs.get_mut(job);
    if (j.start, j.end) != (span.start, span.end) {
        j.start = span.start;
        j.end = span.end;
        j.updated_at = now;
    }
}

fn job_span(session: &Session, job: Handle<RateQueueJob>) -> DateSpan {
    let j = session.rate_jobs.get(job);
    DateSpan::new(j.start, j.end)
}

/// Whether a job will be written: new, or different from what was loaded.
fn job_changed(session: &Session, job: Handle<RateQueueJob>) -> bool {
    session.rate_jobs.state(job) == EntityState::New || !session.rate_jobs.changed_fields(job).is_empty()
}

async fn fan_out(
    repo: &mut JobRepository<'_, '_>,
    job: Handle<RateQueueJob>,
    mappings: &[Handle<ExternalMapping>],
    stats: &mut RateStats,
) -> Result<()> {
    let now = repo.session.now();
    let changed = job_changed(repo.session, job);
    for mapping in mappings {
        if repo.ensure_delivery(job, *mapping, now, changed).await? {
            stats.deliveries += 1;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn capture_rate_changes(
    session: &mut Session,
    tx: &mut Tx<'_>,
    changes: &ChangeSet,
    config: &SyncConfig,
) -> Result<RateStats> {
    let mut stats = RateStats::default();
    let Some(endpoint) = config.endpoints.rate_push.as_deref() else {
        return Ok(stats);
    };
    let windows = affected_windows(session, changes);
    for (resource, spans) in windows {
        if !session.resources.is_live(resource) {
            continue;
        }
        for window in spans {
            session.load_active_rules(tx, resource, window.start, window.end).await?;
            let mut repo = JobRepository::new(session, tx);
            recompute_window(&mut repo, resource, endpoint, window, &mut stats).await?;
            stats.windows += 1;
        }
    }
    if stats != RateStats::default() {
        debug!(?stats, "rate outbox");
    }
    Ok(stats)
}

async fn recompute_window(
    repo: &mut JobRepository<'_, '_>,
    resource: Handle<Resource>,
    endpoint: &str,
    window: DateSpan,
    stats: &mut RateStats,
) -> Result<()> {
    let mappings = repo.session.active_mappings(resource);
    if mappings.is_empty() {
        debug!(resource = %repo.session.resources.key(resource), "no active mapping; rates not queued");
        return Ok(());
    }
    let (ranges, winners) = competing_rules(repo.session, resource, window);
    let fallback = base_rule(repo.session, resource);
    let effective = compress(&ranges, window, fallback.as_ref());
    stats.ranges += effective.len();

    // 1. Clear the window out of every pending job.
    let mut freed: Vec<Handle<RateQueueJob>> = Vec::new();
    for job in repo.overlapping_rate_jobs(resource, endpoint, window).await? {
        match outside(job_span(repo.session, job), window) {
            (None, None) => freed.push(job),
            (Some(piece), None) | (None, Some(piece)) => set_span(repo.session, job, piece),
            (Some(left), Some(right)) => {
                set_span(repo.session, job, left);
                let now = repo.session.now();
                let mut tail = repo.session.rate_jobs.get(job).clone();
                tail.start = right.start;
                tail.end = right.end;
                tail.dispatch = DispatchState::pending(now);
                tail.created_at = now;
                tail.updated_at = now;
                let tail = repo.create_rate_job(tail);
                fan_out(repo, tail, &mappings, stats).await?;
                stats.created += 1;
            }
        }
    }

    // 2. Place each effective range.
    for range in &effective {
        let winner = match range.source {
            SourceId::Rule(key) => winners.get(&key).copied(),
            SourceId::Base(_) => None,
        };
        let neighbours: Vec<_> = repo
            .mergeable_rate_jobs(resource, endpoint, winner, range.span)
            .await?
            .into_iter()
            .filter(|job| !freed.contains(job))
            .collect();

        let job = if let Some((&first, rest)) = neighbours.split_first() {
            let mut span = range.span;
            for job in &neighbours {
                let other = job_span(repo.session, *job);
                span = DateSpan::new(span.start.min(other.start), span.end.max(other.end));
            }
            for other in rest {
                repo.cancel_rate_job(*other, "merged into an adjacent rate job").await?;
                stats.cancelled += 1;
            }
            set_values(repo.session, first, span, range);
            stats.merged += 1;
            first
        } else if let Some(pos) = freed
            .iter()
            .position(|job| repo.session.rate_jobs.get(*job).price_rule == winner)
        {
            let job = freed.remove(pos);
            set_values(repo.session, job, range.span, range);
            stats.merged += 1;
            job
        } else {
            let now = repo.session.now();
            let job = repo.create_rate_job(RateQueueJob {
                resource,
                endpoint: endpoint.to_string(),
                start: range.span.start,
                end: range.span.end,
                price: range.price,
                min_stay: range.min_stay,
                currency: range.currency.clone(),
                price_rule: winner,
                dispatch: DispatchState::pending(now),
                created_at: now,
                updated_at: now,
            });
            stats.created += 1;
            job
        };
        debug!(
            job = %repo.session.rate_jobs.key(job),
            source = %range.source,
            start = %range.span.start,
            end = %range.span.end,
            price = range.price,
            "rate range queued"
        );
        fan_out(repo, job, &mappings, stats).await?;
    }

    // 3. Whatever was freed and not reused no longer applies.
    for job in freed {
        repo.cancel_rate_job(job, "superseded by a newer rate computation").await?;
        stats.cancelled += 1;
    }
    Ok(())
}
