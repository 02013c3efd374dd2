//! Database module: row models, SQL repositories and dispatcher helpers.
//!
//! - `model`: rows as stored, with ids and text-encoded enums.
//! - `repo`: SQL-only functions that read and write those rows.
//! - `dispatch`: claim/complete helpers for the worker draining the outbox.
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod dispatch;
pub mod model;
pub mod repo;

pub use repo::*;
