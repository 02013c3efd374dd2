//! Channel synchronization engine: captures local booking and rate changes
//! inside one SQLite transaction and turns them into outbox rows for the
//! dispatcher that talks to the channel manager.

pub mod compress;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod guards;
pub mod links;
pub mod model;
pub mod normalize;
pub mod outbox;
pub mod recalc;
pub mod session;

pub use engine::{CommitReport, SyncEngine};
pub use error::{GuardViolation, SyncError};
pub use session::{capture_changes, ChangeSet, Handle, Key, Session};
