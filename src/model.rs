use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{Entity, Handle};

/// Where a record came from: typed in by staff or imported from a channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Channel,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Origin::Local),
            "channel" => Some(Origin::Channel),
            _ => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Origin::Channel)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Tentative,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
    Blocked,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Tentative => "tentative",
            EventStatus::Confirmed => "confirmed",
            EventStatus::CheckedIn => "checked_in",
            EventStatus::CheckedOut => "checked_out",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tentative" => Some(EventStatus::Tentative),
            "confirmed" => Some(EventStatus::Confirmed),
            "checked_in" => Some(EventStatus::CheckedIn),
            "checked_out" => Some(EventStatus::CheckedOut),
            "cancelled" => Some(EventStatus::Cancelled),
            "blocked" => Some(EventStatus::Blocked),
            _ => None,
        }
    }

    /// A guest has committed to the stay.
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            EventStatus::Confirmed | EventStatus::CheckedIn | EventStatus::CheckedOut
        )
    }

    /// Statuses after which a remote booking no longer occupies the calendar.
    pub fn is_closed(&self) -> bool {
        matches!(self, EventStatus::Cancelled | EventStatus::Blocked)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(PaymentStatus::Unpaid),
            "partial" => Some(PaymentStatus::Partial),
            "paid" => Some(PaymentStatus::Paid),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    pub fn from_totals(total: i64, paid: i64) -> Self {
        if paid <= 0 {
            PaymentStatus::Unpaid
        } else if paid >= total {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Detached,
    PendingDelete,
    PendingMove,
    SyncedDeleted,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Detached => "detached",
            LinkStatus::PendingDelete => "pending_delete",
            LinkStatus::PendingMove => "pending_move",
            LinkStatus::SyncedDeleted => "synced_deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LinkStatus::Active),
            "detached" => Some(LinkStatus::Detached),
            "pending_delete" => Some(LinkStatus::PendingDelete),
            "pending_move" => Some(LinkStatus::PendingMove),
            "synced_deleted" => Some(LinkStatus::SyncedDeleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// What a push job asks the remote system to do with a booking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PushIntent {
    Upsert,
    Delete,
}

impl PushIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushIntent::Upsert => "upsert",
            PushIntent::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(PushIntent::Upsert),
            "delete" => Some(PushIntent::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    /// Base nightly rate in minor units; the fallback when no price rule applies.
    pub base_price: Option<i64>,
    pub base_min_stay: i32,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMapping {
    pub resource: Handle<Resource>,
    pub external_room_id: String,
    pub external_property_id: String,
    pub active: bool,
    pub principal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub origin: Origin,
    pub data_locked: bool,
    pub guest_name: String,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
    pub comment: Option<String>,
    pub internal_note: Option<String>,
    pub total_price: i64,
    pub total_paid: i64,
    pub guest_count: i32,
    pub event_count: i32,
    pub payment_status: PaymentStatus,
    pub arrival_at: Option<DateTime<Utc>>,
    pub departure_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(origin: Origin, guest_name: impl Into<String>) -> Self {
        Self {
            origin,
            data_locked: false,
            guest_name: guest_name.into(),
            guest_email: None,
            guest_phone: None,
            comment: None,
            internal_note: None,
            total_price: 0,
            total_paid: 0,
            guest_count: 0,
            event_count: 0,
            payment_status: PaymentStatus::Unpaid,
            arrival_at: None,
            departure_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub resource: Handle<Resource>,
    pub reservation: Option<Handle<Reservation>>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub payment_status: PaymentStatus,
    pub origin: Origin,
    pub adults: i32,
    pub children: i32,
    pub price_total: i64,
    pub paid_amount: i64,
    /// Cached display title, rewritten by normalization before every flush.
    pub title: String,
}

impl CalendarEvent {
    pub fn new(
        resource: Handle<Resource>,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        status: EventStatus,
    ) -> Self {
        Self {
            resource,
            reservation: None,
            start_at: Some(start_at),
            end_at: Some(end_at),
            status,
            payment_status: PaymentStatus::Unpaid,
            origin: Origin::Local,
            adults: 0,
            children: 0,
            price_total: 0,
            paid_amount: 0,
            title: String::new(),
        }
    }

    pub fn has_dates(&self) -> bool {
        self.start_at.is_some() && self.end_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLink {
    pub event: Handle<CalendarEvent>,
    pub mapping: Option<Handle<ExternalMapping>>,
    pub external_booking_id: Option<String>,
    pub status: LinkStatus,
    pub last_seen_at: DateTime<Utc>,
    /// `None` marks the root link of the event.
    pub origin_link: Option<Handle<SyncLink>>,
}

/// Claim/retry bookkeeping shared by every outbox row the dispatcher drains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchState {
    pub status: JobStatus,
    pub retry_count: i32,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_http_code: Option<i32>,
    pub last_request_raw: Option<String>,
    pub last_response_raw: Option<String>,
    pub failed_reason: Option<String>,
}

impl DispatchState {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Pending,
            retry_count: 0,
            next_run_at: now,
            locked_by: None,
            locked_at: None,
            last_http_code: None,
            last_request_raw: None,
            last_response_raw: None,
            failed_reason: None,
        }
    }

    /// Put the row back in the queue, dropping any claim a worker holds.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.next_run_at = now;
        self.locked_by = None;
        self.locked_at = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushJob {
    pub link: Option<Handle<SyncLink>>,
    pub endpoint: String,
    pub intent: PushIntent,
    pub dispatch: DispatchState,
    pub dedupe_key: String,
    pub external_id_at_creation: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceRule {
    pub resource: Handle<Resource>,
    /// Half-open `[start, end)`.
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
    pub important: bool,
    pub weight: i32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateQueueJob {
    pub resource: Handle<Resource>,
    pub endpoint: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
    /// Winning rule, `None` when the resource base rate won.
    pub price_rule: Option<Handle<PriceRule>>,
    pub dispatch: DispatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDelivery {
    pub job: Handle<RateQueueJob>,
    pub mapping: Handle<ExternalMapping>,
    pub dispatch: DispatchState,
    pub effective_at: DateTime<Utc>,
}

macro_rules! changed_fields {
    ($new:expr, $old:expr, [$($field:ident),* $(,)?]) => {{
        let mut changed = Vec::new();
        $(
            if $new.$field != $old.$field {
                changed.push(stringify!($field));
            }
        )*
        changed
    }};
}

impl Entity for Resource {
    const KIND: &'static str = "resource";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(self, original, [name, base_price, base_min_stay, currency])
    }
}

impl Entity for ExternalMapping {
    const KIND: &'static str = "mapping";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [resource, external_room_id, external_property_id, active, principal]
        )
    }
}

impl Entity for Reservation {
    const KIND: &'static str = "reservation";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [
                origin,
                data_locked,
                guest_name,
                guest_email,
                guest_phone,
                comment,
                internal_note,
                total_price,
                total_paid,
                guest_count,
                event_count,
                payment_status,
                arrival_at,
                departure_at,
            ]
        )
    }
}

impl Entity for CalendarEvent {
    const KIND: &'static str = "event";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [
                resource,
                reservation,
                start_at,
                end_at,
                status,
                payment_status,
                origin,
                adults,
                children,
                price_total,
                paid_amount,
                title,
            ]
        )
    }
}

impl Entity for SyncLink {
    const KIND: &'static str = "link";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [event, mapping, external_booking_id, status, last_seen_at, origin_link]
        )
    }
}

impl Entity for PushJob {
    const KIND: &'static str = "push_job";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [link, endpoint, intent, dispatch, dedupe_key, external_id_at_creation, payload]
        )
    }
}

impl Entity for PriceRule {
    const KIND: &'static str = "price_rule";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [resource, start, end, price, min_stay, currency, important, weight, active]
        )
    }
}

impl Entity for RateQueueJob {
    const KIND: &'static str = "rate_job";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(
            self,
            original,
            [resource, endpoint, start, end, price, min_stay, currency, price_rule, dispatch]
        )
    }
}

impl Entity for RateDelivery {
    const KIND: &'static str = "rate_delivery";

    fn changed_fields(&self, original: &Self) -> Vec<&'static str> {
        changed_fields!(self, original, [job, mapping, dispatch, effective_at])
    }
}
