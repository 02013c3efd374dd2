//! Change-capture outboxes: booking pushes and rate jobs, written in the same
//! transaction as the change that caused them.

pub mod booking;
pub mod jobs;
pub mod rates;

pub use booking::{capture_booking_changes, BookingStats, PushPayload};
pub use jobs::{Enqueued, JobRepository};
pub use rates::{capture_rate_changes, RateStats};
