//! Admin review endpoints for bind/open and profile-change requests.

use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::storage::queries_requests::{review_profile_change_request, review_user_request};
use crate::storage::{DatabaseError, UserRequest, unix_timestamp};

use super::AppState;
use super::auth::AuthContext;

#[derive(Debug, Deserialize)]
pub struct AdminRequestsQuery {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub limit: i64,
}

/// A request row annotated with duplicate-detection counters, so reviewers
/// see repeated applicants first.
#[derive(Debug, Serialize)]
pub struct AnnotatedRequest {
    #[serde(flatten)]
    pub request: UserRequest,
    pub apply_count_by_billing: i64,
    pub duplicate_flag: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub duplicate_reason: String,
}

/// `GET /api/admin/requests` — pending/filtered requests, duplicates first.
pub async fn admin_requests_list(
    State(state): State<AppState>,
    Query(query): Query<AdminRequestsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.db.list_user_requests_admin(&query.status, query.limit).await?;
    Ok(Json(serde_json::json!({ "requests": annotate_requests(records) })))
}

/// Count duplicates per billing user and per (node, local) pair, flag them,
/// and sort flagged rows first (newest first within each group).
fn annotate_requests(records: Vec<UserRequest>) -> Vec<AnnotatedRequest> {
    use std::collections::HashMap;

    let mut by_billing: HashMap<String, i64> = HashMap::new();
    let mut by_node_local: HashMap<(String, String), i64> = HashMap::new();
    for record in &records {
        let billing = record.billing_username.trim();
        if !billing.is_empty() {
            *by_billing.entry(billing.to_string()).or_default() += 1;
        }
        let key = (record.node_id.trim().to_string(), record.local_username.trim().to_string());
        if !(key.0.is_empty() && key.1.is_empty()) {
            *by_node_local.entry(key).or_default() += 1;
        }
    }

    let mut out: Vec<AnnotatedRequest> = records
        .into_iter()
        .map(|request| {
            let billing_count =
                by_billing.get(request.billing_username.trim()).copied().unwrap_or(0);
            let node_local_count = by_node_local
                .get(&(
                    request.node_id.trim().to_string(),
                    request.local_username.trim().to_string(),
                ))
                .copied()
                .unwrap_or(0);

            let mut reasons = Vec::new();
            if billing_count > 1 {
                reasons.push("same billing user applied more than once");
            }
            if node_local_count > 1 {
                reasons.push("same node and local username applied more than once");
            }
            AnnotatedRequest {
                duplicate_flag: !reasons.is_empty(),
                duplicate_reason: reasons.join("; "),
                apply_count_by_billing: billing_count,
                request,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.duplicate_flag
            .cmp(&a.duplicate_flag)
            .then(b.request.request_id.cmp(&a.request.request_id))
    });
    out
}

/// `POST /api/admin/requests/{id}/approve`
pub async fn admin_request_approve(
    state: State<AppState>,
    auth: Extension<AuthContext>,
    id: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    review_request(state, auth, id, "approved").await
}

/// `POST /api/admin/requests/{id}/reject`
pub async fn admin_request_reject(
    state: State<AppState>,
    auth: Extension<AuthContext>,
    id: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    review_request(state, auth, id, "rejected").await
}

async fn review_request(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(request_id): Path<i64>,
    new_status: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut tx = state.db.pool().begin().await.map_err(DatabaseError::from)?;
    let updated =
        review_user_request(&mut *tx, request_id, new_status, auth.operator(), unix_timestamp())
            .await?;
    tx.commit().await.map_err(DatabaseError::from)?;
    Ok(Json(serde_json::json!({ "ok": true, "request": updated })))
}

#[derive(Debug, Deserialize)]
pub struct ProfileChangeAdminQuery {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub limit: i64,
}

/// `GET /api/admin/profile-change-requests`
pub async fn profile_changes_list(
    State(state): State<AppState>,
    Query(query): Query<ProfileChangeAdminQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requests = state
        .db
        .list_profile_change_requests_admin(&query.status, &query.username, query.limit)
        .await?;
    Ok(Json(serde_json::json!({ "requests": requests })))
}

/// `POST /api/admin/profile-change-requests/{id}/approve` — runs the rename
/// cascade in one transaction.
pub async fn profile_change_approve(
    state: State<AppState>,
    auth: Extension<AuthContext>,
    id: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    review_profile_change(state, auth, id, "approved").await
}

/// `POST /api/admin/profile-change-requests/{id}/reject`
pub async fn profile_change_reject(
    state: State<AppState>,
    auth: Extension<AuthContext>,
    id: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    review_profile_change(state, auth, id, "rejected").await
}

async fn review_profile_change(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(request_id): Path<i64>,
    new_status: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut tx = state.db.pool().begin().await.map_err(DatabaseError::from)?;
    let updated = review_profile_change_request(
        &mut *tx,
        request_id,
        new_status,
        auth.operator(),
        unix_timestamp(),
    )
    .await?;
    tx.commit().await.map_err(DatabaseError::from)?;
    Ok(Json(serde_json::json!({ "ok": true, "request": updated })))
}
