//! HTTP surface over the orchestrator and the history store.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::observability::{CostLedger, MetricsCollector};
use crate::pipeline::types::ReviewPriority;
use crate::pipeline::{Orchestrator, PipelineState, RawEmail, Verdict};
use crate::store::HistoryStore;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// None when the server runs without persistence.
    pub history: Option<Arc<dyn HistoryStore>>,
    pub metrics: Arc<MetricsCollector>,
    pub costs: Arc<CostLedger>,
    /// Concurrency bound for `/process/batch`.
    pub batch_concurrency: usize,
}

/// Build the Axum router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process", post(process))
        .route("/process/batch", post(process_batch))
        .route("/history", get(list_history).delete(clear_history))
        .route("/history/{id}", get(get_run).delete(delete_run))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({"error": message.into()})))
}

fn no_history() -> ApiResponse {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "History store not configured",
    )
}

fn parse_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid request ID"))
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "agentflow",
            "history": state.history.is_some(),
        })),
    )
}

// ── Processing ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

impl From<ProcessRequest> for RawEmail {
    fn from(req: ProcessRequest) -> Self {
        RawEmail::new(req.sender, req.subject, req.body)
    }
}

/// What a caller needs to act on a finished run.
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub request_id: Uuid,
    pub verdict: Option<Verdict>,
    pub confidence: Option<f64>,
    pub rationale: Option<String>,
    pub priority: Option<ReviewPriority>,
    pub estimated_review_minutes: Option<u32>,
    pub draft_subject: Option<String>,
    pub draft_body: Option<String>,
    pub retry_count: u32,
    pub cost_usd: Decimal,
    pub failed_stage: Option<String>,
}

impl From<&PipelineState> for ProcessResponse {
    fn from(state: &PipelineState) -> Self {
        let decision = state.decision();
        Self {
            request_id: state.request_id(),
            verdict: decision.map(|d| d.verdict),
            confidence: decision.map(|d| d.confidence),
            rationale: decision.map(|d| d.rationale.clone()),
            priority: decision.map(|d| d.priority),
            estimated_review_minutes: decision.map(|d| d.estimated_review_minutes),
            draft_subject: state.draft().map(|d| d.subject.clone()),
            draft_body: state.draft().map(|d| d.body.clone()),
            retry_count: state.retry_count(),
            cost_usd: state.total_cost().usd,
            failed_stage: state.failure().map(|f| f.stage.to_string()),
        }
    }
}

async fn record(state: &AppState, run: &PipelineState) {
    if let Some(ref history) = state.history
        && let Err(e) = history.record(run).await
    {
        error!(request_id = %run.request_id(), error = %e, "Failed to record run");
    }
}

fn pipeline_error(e: PipelineError) -> ApiResponse {
    match e {
        PipelineError::Validation(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

async fn process(State(state): State<AppState>, Json(body): Json<ProcessRequest>) -> ApiResponse {
    match state.orchestrator.process(body.into()).await {
        Ok(run) => {
            record(&state, &run).await;
            (StatusCode::OK, Json(json!(ProcessResponse::from(&run))))
        }
        Err(e) => pipeline_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    emails: Vec<ProcessRequest>,
}

async fn process_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> ApiResponse {
    let emails: Vec<RawEmail> = body.emails.into_iter().map(RawEmail::from).collect();
    info!(count = emails.len(), "Batch request received");

    let results = state
        .orchestrator
        .process_batch(emails, state.batch_concurrency)
        .await;

    let mut items = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(run) => {
                record(&state, &run).await;
                items.push(json!(ProcessResponse::from(&run)));
            }
            Err(e) => items.push(json!({"error": e.to_string()})),
        }
    }
    (StatusCode::OK, Json(json!({"results": items})))
}

// ── History ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse {
    let Some(history) = state.history else {
        return no_history();
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    match history.list(limit).await {
        Ok(runs) => (StatusCode::OK, Json(json!(runs))),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let Some(history) = state.history else {
        return no_history();
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match history.get(id).await {
        Ok(Some(run)) => (StatusCode::OK, Json(json!(run))),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Run not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let Some(history) = state.history else {
        return no_history();
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match history.delete(id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "deleted"}))),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Run not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn clear_history(State(state): State<AppState>) -> ApiResponse {
    let Some(history) = state.history else {
        return no_history();
    };
    match history.clear().await {
        Ok(removed) => (StatusCode::OK, Json(json!({"removed": removed}))),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── Stats & metrics ─────────────────────────────────────────────────

async fn stats(State(state): State<AppState>) -> ApiResponse {
    let history = match state.history {
        Some(ref history) => match history.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "History stats unavailable");
                None
            }
        },
        None => None,
    };
    (
        StatusCode::OK,
        Json(json!({
            "history": history,
            "costs": state.costs.summary(),
        })),
    )
}

async fn metrics(State(state): State<AppState>) -> ApiResponse {
    (StatusCode::OK, Json(json!(state.metrics.snapshot())))
}
