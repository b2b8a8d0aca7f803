//! Observability sink: per-stage trace events and the collectors that
//! consume them.
//!
//! Sinks are synchronous and must return immediately. The orchestrator calls
//! `record` inline, so an implementation that needs I/O should hand the event
//! to a channel (see `ChannelSink`) rather than block.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::llm::TokenCost;
use crate::pipeline::state::PipelinePhase;
use crate::pipeline::types::{StageKind, Verdict};

// ── Events ──────────────────────────────────────────────────────────

/// How one stage execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceOutcome {
    /// The stage's field was committed.
    Committed,
    /// A collaborator failed and the field was committed with a fallback value.
    Degraded { reason: String },
    /// The stage failed; the decision will be forced.
    Failed { reason: String },
    /// The terminal decision was committed.
    Decided { verdict: Verdict, confidence: f64 },
}

impl TraceOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Degraded { .. } => "degraded",
            Self::Failed { .. } => "failed",
            Self::Decided { .. } => "decided",
        }
    }
}

/// One structured event per stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub request_id: Uuid,
    pub stage: StageKind,
    /// 1-based; greater than 1 only for Writer and Quality Gate re-runs.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cost_delta: TokenCost,
    /// Calls made, including retried ones.
    pub calls: u32,
    pub outcome: TraceOutcome,
    pub phase_after: PipelinePhase,
    /// The field this stage wrote, as JSON. `null` when nothing was written.
    pub diff: serde_json::Value,
}

/// Fire-and-forget consumer of trace events.
pub trait ObservabilitySink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn record(&self, _event: &TraceEvent) {}
}

/// Writes every event as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, event: &TraceEvent) {
        match &event.outcome {
            TraceOutcome::Committed => debug!(
                request_id = %event.request_id,
                stage = %event.stage,
                attempt = event.attempt,
                duration_ms = event.duration_ms,
                tokens = event.cost_delta.total_tokens(),
                "Stage committed"
            ),
            TraceOutcome::Degraded { reason } => warn!(
                request_id = %event.request_id,
                stage = %event.stage,
                reason = %reason,
                "Stage degraded"
            ),
            TraceOutcome::Failed { reason } => warn!(
                request_id = %event.request_id,
                stage = %event.stage,
                attempt = event.attempt,
                reason = %reason,
                "Stage failed"
            ),
            TraceOutcome::Decided {
                verdict,
                confidence,
            } => info!(
                request_id = %event.request_id,
                verdict = %verdict,
                confidence = *confidence,
                "Decision made"
            ),
        }
    }
}

/// Forwards events into a bounded channel. Full or closed channels drop the
/// event.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TraceEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TraceEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ObservabilitySink for ChannelSink {
    fn record(&self, event: &TraceEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            debug!(request_id = %event.request_id, "Trace event dropped: {}", e);
        }
    }
}

/// Sends each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ObservabilitySink for FanoutSink {
    fn record(&self, event: &TraceEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// A poisoned lock still holds valid counters.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Cost ledger ─────────────────────────────────────────────────────

/// Cross-request cost aggregate, per stage and in total.
#[derive(Debug, Default)]
pub struct CostLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    total: TokenCost,
    by_stage: HashMap<StageKind, TokenCost>,
    requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub total: TokenCost,
    pub by_stage: BTreeMap<String, TokenCost>,
    /// Requests that reached a decision.
    pub requests: u64,
    pub avg_usd_per_request: Decimal,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> TokenCost {
        lock(&self.inner).total.clone()
    }

    pub fn for_stage(&self, stage: StageKind) -> TokenCost {
        lock(&self.inner)
            .by_stage
            .get(&stage)
            .cloned()
            .unwrap_or_default()
    }

    pub fn summary(&self) -> CostSummary {
        let inner = lock(&self.inner);
        let avg = if inner.requests == 0 {
            Decimal::ZERO
        } else {
            (inner.total.usd / Decimal::from(inner.requests)).round_dp(6)
        };
        CostSummary {
            total: inner.total.clone(),
            by_stage: inner
                .by_stage
                .iter()
                .map(|(k, v)| (k.label().to_string(), v.clone()))
                .collect(),
            requests: inner.requests,
            avg_usd_per_request: avg,
        }
    }
}

impl ObservabilitySink for CostLedger {
    fn record(&self, event: &TraceEvent) {
        let mut inner = lock(&self.inner);
        if !event.cost_delta.is_zero() {
            inner.total += event.cost_delta.clone();
            *inner.by_stage.entry(event.stage).or_default() += event.cost_delta.clone();
        }
        if matches!(event.outcome, TraceOutcome::Decided { .. }) {
            inner.requests += 1;
        }
    }
}

// ── Metrics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageMetrics {
    pub executions: u64,
    pub calls: u64,
    pub degraded: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub verdicts: BTreeMap<String, u64>,
    pub decisions: u64,
    pub avg_confidence: f64,
}

/// Per-stage counters and verdict distribution.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    stages: HashMap<StageKind, StageMetrics>,
    verdicts: HashMap<Verdict, u64>,
    confidence_sum: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = lock(&self.inner);
        let decisions: u64 = inner.verdicts.values().sum();
        let stages = inner
            .stages
            .iter()
            .map(|(kind, m)| {
                let mut m = m.clone();
                if m.executions > 0 {
                    m.avg_duration_ms = m.total_duration_ms as f64 / m.executions as f64;
                }
                (kind.label().to_string(), m)
            })
            .collect();
        MetricsSnapshot {
            stages,
            verdicts: inner
                .verdicts
                .iter()
                .map(|(v, n)| (v.label().to_string(), *n))
                .collect(),
            decisions,
            avg_confidence: if decisions == 0 {
                0.0
            } else {
                inner.confidence_sum / decisions as f64
            },
        }
    }
}

impl ObservabilitySink for MetricsCollector {
    fn record(&self, event: &TraceEvent) {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let stage = inner.stages.entry(event.stage).or_default();
        stage.executions += 1;
        stage.calls += u64::from(event.calls);
        stage.total_duration_ms += event.duration_ms;
        match &event.outcome {
            TraceOutcome::Degraded { .. } => stage.degraded += 1,
            TraceOutcome::Failed { .. } => stage.failures += 1,
            TraceOutcome::Decided {
                verdict,
                confidence,
            } => {
                *inner.verdicts.entry(*verdict).or_default() += 1;
                inner.confidence_sum += confidence;
            }
            TraceOutcome::Committed => {}
        }
    }
}
