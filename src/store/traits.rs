//! `HistoryStore`: persistence for finished pipeline runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::{PipelineState, Verdict};

/// One row of the history list.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub request_id: Uuid,
    pub sender: String,
    pub subject: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub retry_count: u32,
    pub cost_usd: Decimal,
    /// Stage whose failure forced the decision, if any.
    pub failed_stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Aggregates over every stored run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub autonomous: u64,
    pub review: u64,
    pub escalate: u64,
    pub avg_confidence: f64,
    pub avg_retries: f64,
    pub total_cost_usd: Decimal,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Persist a terminal state. Non-terminal states are rejected.
    async fn record(&self, state: &PipelineState) -> Result<(), DatabaseError>;

    async fn get(&self, request_id: Uuid) -> Result<Option<PipelineState>, DatabaseError>;

    /// Newest first.
    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, DatabaseError>;

    /// Returns whether a run was deleted.
    async fn delete(&self, request_id: Uuid) -> Result<bool, DatabaseError>;

    /// Delete everything. Returns the number of runs removed.
    async fn clear(&self) -> Result<u64, DatabaseError>;

    async fn stats(&self) -> Result<HistoryStats, DatabaseError>;
}
