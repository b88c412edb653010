//! # planline-store
//!
//! SQLite-backed durability for planline: the append-only event log, the
//! materialized `tasks` projection, snapshots, and the write-behind
//! [`PersistenceService`] that feeds them.

pub mod database;
pub mod error;
pub mod event_log;
pub mod loader;
pub mod persistence;
pub mod row_helpers;
pub mod schema;
pub mod snapshots;
pub mod task_table;

pub use database::Database;
pub use error::StoreError;
pub use event_log::{EventLog, StoredEvent};
pub use loader::{DataLoader, LoadedState};
pub use persistence::{FlushReport, PersistenceService};
pub use snapshots::{SnapshotRecord, SnapshotService};
pub use task_table::TaskTable;
