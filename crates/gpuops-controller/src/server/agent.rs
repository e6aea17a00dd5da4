//! Agent-facing endpoints: metric ingest and the action long-poll.

use axum::Json;
use axum::extract::{Query, State};
use chrono::Utc;
use gpuops_core::{ActionsResponse, MetricReport};
use serde::Deserialize;

use crate::billing::process_report;
use crate::error::ApiError;

use super::AppState;

/// `POST /api/metrics` — bill one report and return the actions the node
/// must execute, operator-queued actions included.
pub async fn handle_metrics(
    State(state): State<AppState>,
    Json(report): Json<MetricReport>,
) -> Result<Json<ActionsResponse>, ApiError> {
    if report.node_id.trim().is_empty() {
        return Err(ApiError::Validation("node_id must not be empty".into()));
    }
    if report.report_id.trim().is_empty() {
        return Err(ApiError::Validation(
            "report_id must not be empty (it deduplicates retries)".into(),
        ));
    }

    let received_at = Utc::now();
    let outcome =
        process_report(&state.db, &state.config, &state.outbox, &report, received_at).await?;
    state.metrics.observe_report(
        received_at.timestamp(),
        outcome.duplicate,
        outcome.usage_records,
        &outcome.actions,
    );
    Ok(Json(ActionsResponse { actions: outcome.actions }))
}

#[derive(Debug, Deserialize)]
pub struct NodeActionsQuery {
    #[serde(default)]
    pub node_id: String,
}

/// `GET /api/node/actions` — destructive drain of the node's outbox, polled
/// by agents between reports for low-latency operator actions.
pub async fn handle_node_actions(
    State(state): State<AppState>,
    Query(query): Query<NodeActionsQuery>,
) -> Result<Json<ActionsResponse>, ApiError> {
    let node_id = query.node_id.trim();
    if node_id.is_empty() {
        return Err(ApiError::Validation("node_id must not be empty".into()));
    }
    Ok(Json(ActionsResponse { actions: state.outbox.drain(node_id) }))
}
