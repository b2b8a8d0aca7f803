//! libSQL backend for `HistoryStore`.
//!
//! Each run is stored as the full state JSON plus a handful of summary
//! columns for listing and stats. Supports local file and in-memory
//! databases.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::{PipelineState, Verdict};
use crate::store::migrations;
use crate::store::traits::{HistoryStats, HistoryStore, RunSummary};

const SUMMARY_COLUMNS: &str = "request_id, sender, subject, verdict, confidence, retry_count, \
     cost_usd, failed_stage, created_at, completed_at";

/// libSQL history store. One connection, reused for every operation.
pub struct LibSqlHistoryStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlHistoryStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "History database opened");
        Ok(store)
    }

    /// In-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn row_to_summary(row: &libsql::Row) -> Result<RunSummary, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("history row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let verdict_str: String = row.get(3).map_err(get_err)?;
    let retry_count: i64 = row.get(5).map_err(get_err)?;
    let cost_str: String = row.get(6).map_err(get_err)?;
    let created_str: String = row.get(8).map_err(get_err)?;
    let completed_str: String = row.get(9).map_err(get_err)?;

    Ok(RunSummary {
        request_id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("request_id {id_str}: {e}")))?,
        sender: row.get(1).map_err(get_err)?,
        subject: row.get(2).map_err(get_err)?,
        verdict: Verdict::parse(&verdict_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown verdict {verdict_str}"))
        })?,
        confidence: row.get(4).map_err(get_err)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        cost_usd: parse_decimal(&cost_str),
        failed_stage: row.get::<String>(7).ok(),
        created_at: parse_datetime(&created_str),
        completed_at: parse_datetime(&completed_str),
    })
}

#[async_trait]
impl HistoryStore for LibSqlHistoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn record(&self, state: &PipelineState) -> Result<(), DatabaseError> {
        let (Some(decision), Some(completed_at)) = (state.decision(), state.completed_at()) else {
            return Err(DatabaseError::Constraint(format!(
                "run {} is not terminal (phase {})",
                state.request_id(),
                state.phase()
            )));
        };
        let state_json = serde_json::to_string(state)
            .map_err(|e| DatabaseError::Serialization(format!("state: {e}")))?;
        let failed_stage: libsql::Value = match state.failure() {
            Some(f) => libsql::Value::Text(f.stage.to_string()),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                "INSERT INTO pipeline_runs (request_id, sender, subject, verdict, confidence, \
                 retry_count, cost_usd, failed_stage, created_at, completed_at, state_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    state.request_id().to_string(),
                    state.raw_email().sender.clone(),
                    state.raw_email().subject.clone(),
                    decision.verdict.label(),
                    decision.confidence,
                    i64::from(state.retry_count()),
                    state.total_cost().usd.to_string(),
                    failed_stage,
                    timestamp(state.created_at()),
                    timestamp(completed_at),
                    state_json,
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint") {
                    DatabaseError::Constraint(format!(
                        "run {} already recorded",
                        state.request_id()
                    ))
                } else {
                    DatabaseError::Query(format!("record: {msg}"))
                }
            })?;

        debug!(request_id = %state.request_id(), verdict = %decision.verdict, "Run recorded");
        Ok(())
    }

    async fn get(&self, request_id: Uuid) -> Result<Option<PipelineState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state_json FROM pipeline_runs WHERE request_id = ?1",
                params![request_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get row parse: {e}")))?;
                let state = serde_json::from_str(&json)
                    .map_err(|e| DatabaseError::Serialization(format!("state: {e}")))?;
                Ok(Some(state))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM pipeline_runs \
                     ORDER BY completed_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list: {e}")))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list: {e}")))?
        {
            runs.push(row_to_summary(&row)?);
        }
        Ok(runs)
    }

    async fn delete(&self, request_id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM pipeline_runs WHERE request_id = ?1",
                params![request_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete: {e}")))?;
        Ok(affected > 0)
    }

    async fn clear(&self) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM pipeline_runs", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear: {e}")))?;
        info!(removed = affected, "History cleared");
        Ok(affected)
    }

    async fn stats(&self) -> Result<HistoryStats, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN verdict = 'AUTONOMOUS' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN verdict = 'REVIEW' THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN verdict = 'ESCALATE' THEN 1 ELSE 0 END), 0), \
                 COALESCE(AVG(confidence), 0.0), \
                 COALESCE(AVG(CAST(retry_count AS REAL)), 0.0) \
                 FROM pipeline_runs",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?
        else {
            return Ok(HistoryStats::default());
        };
        let get_err = |e: libsql::Error| DatabaseError::Query(format!("stats row parse: {e}"));
        let count = |i: i32| -> Result<u64, DatabaseError> {
            let v: i64 = row.get(i).map_err(get_err)?;
            Ok(u64::try_from(v).unwrap_or(0))
        };
        let mut stats = HistoryStats {
            total: count(0)?,
            autonomous: count(1)?,
            review: count(2)?,
            escalate: count(3)?,
            avg_confidence: row.get(4).map_err(get_err)?,
            avg_retries: row.get(5).map_err(get_err)?,
            total_cost_usd: Decimal::ZERO,
        };

        let mut costs = conn
            .query("SELECT cost_usd FROM pipeline_runs", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats cost: {e}")))?;
        while let Some(row) = costs
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats cost: {e}")))?
        {
            let cost: String = row.get(0).map_err(get_err)?;
            stats.total_cost_usd += parse_decimal(&cost);
        }
        Ok(stats)
    }
}
