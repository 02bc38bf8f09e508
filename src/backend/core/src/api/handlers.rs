//! HTTP handlers.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::{ApiResponse, AppState};
use crate::audit::{AuditEntry, AuditVerification};
use crate::bus::DeadLetter;
use crate::consumer::ConsumerStatsSnapshot;
use crate::error::{Result, TaskflowError};
use crate::events::TaskId;

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct TaskAuditResponse {
    pub entries: Vec<AuditEntry>,
    pub verification: AuditVerification,
}

pub async fn task_audit(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskAuditResponse>>> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|e| TaskflowError::invalid_input(format!("invalid task id '{}': {}", task_id, e)))?;

    let entries = state.audit.history(task_id).await?;
    let verification = state.audit.verify(task_id).await?;
    if !verification.is_consistent() {
        tracing::warn!(
            task_id = %task_id,
            gaps = ?verification.gaps,
            duplicates = verification.duplicate_events.len(),
            "Audit log inconsistency"
        );
    }

    Ok(Json(ApiResponse::success(TaskAuditResponse { entries, verification })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consumers & Dead Letters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct ConsumerStatsEntry {
    pub consumer: String,
    #[serde(flatten)]
    pub stats: ConsumerStatsSnapshot,
}

pub async fn consumer_stats(State(state): State<AppState>) -> Json<ApiResponse<Vec<ConsumerStatsEntry>>> {
    let entries = state
        .consumers
        .iter()
        .map(|(name, stats)| ConsumerStatsEntry {
            consumer: name.clone(),
            stats: stats.snapshot(),
        })
        .collect();
    Json(ApiResponse::success(entries))
}

pub async fn recent_dead_letters(State(state): State<AppState>) -> Json<ApiResponse<Vec<DeadLetter>>> {
    Json(ApiResponse::success(state.dead_letters.recent()))
}
