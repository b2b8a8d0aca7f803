//! Persistence layer: libSQL-backed history of finished pipeline runs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlHistoryStore;
pub use traits::{HistoryStats, HistoryStore, RunSummary};
