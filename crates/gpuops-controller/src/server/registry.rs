//! Identity registry endpoints: resolution, PAM text lists, and the
//! self-service request endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use gpuops_core::ResolveResponse;
use serde::Deserialize;

use crate::error::ApiError;
use crate::storage::queries_requests::create_user_request;
use crate::storage::{Resolution, unix_timestamp};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub local_username: String,
}

/// `GET /api/registry/resolve` — classify a (node, local user) pair for the
/// node's login hook.
pub async fn handle_resolve(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let node_id = query.node_id.trim();
    let local_username = query.local_username.trim();
    if node_id.is_empty() || local_username.is_empty() {
        return Err(ApiError::Validation("node_id/local_username must not be empty".into()));
    }

    let resolution = state.db.resolve_identity(node_id, local_username).await?;
    let response = match resolution {
        Resolution::Exempted => ResolveResponse {
            registered: true,
            billing_username: Some(local_username.to_string()),
            exempted: true,
            ..Default::default()
        },
        Resolution::Blacklisted => ResolveResponse {
            registered: false,
            blacklisted: true,
            ..Default::default()
        },
        Resolution::Bound(billing) => ResolveResponse {
            registered: true,
            billing_username: Some(billing),
            ..Default::default()
        },
        Resolution::Whitelisted => ResolveResponse {
            registered: true,
            billing_username: Some(local_username.to_string()),
            whitelisted: true,
            ..Default::default()
        },
        Resolution::Unknown => ResolveResponse::default(),
    };
    Ok(Json(response))
}

fn plain_text_lines(users: Vec<String>) -> Response {
    let body = if users.is_empty() { String::new() } else { users.join("\n") + "\n" };
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// `GET /api/registry/nodes/{id}/users.txt` — local users allowed to log in
/// (bindings plus whitelist), one per line, for the PAM hook's cache.
pub async fn handle_node_users_txt(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Response, ApiError> {
    let users = state.db.list_allowed_local_users(node_id.trim(), 200_000).await?;
    Ok(plain_text_lines(users))
}

/// `GET /api/registry/nodes/{id}/blocked.txt` — blacklist, one per line.
pub async fn handle_node_blocked_txt(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Response, ApiError> {
    let users = state.db.list_denied_local_users(node_id.trim(), 200_000).await?;
    Ok(plain_text_lines(users))
}

/// `GET /api/registry/nodes/{id}/exempt.txt` — exemptions, one per line.
pub async fn handle_node_exempt_txt(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Response, ApiError> {
    let users = state.db.list_exempt_local_users(node_id.trim(), 200_000).await?;
    Ok(plain_text_lines(users))
}

#[derive(Debug, Deserialize)]
pub struct BindRequestsCreate {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub items: Vec<BindRequestItem>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct BindRequestItem {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub local_username: String,
}

/// `POST /api/requests/bind` — batch of bind requests, all-or-nothing.
pub async fn handle_bind_requests_create(
    State(state): State<AppState>,
    Json(req): Json<BindRequestsCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing_username = req.billing_username.trim();
    if billing_username.is_empty() {
        return Err(ApiError::Validation("billing_username must not be empty".into()));
    }
    if req.items.is_empty() {
        return Err(ApiError::Validation("items must not be empty".into()));
    }
    if req.items.len() > 200 {
        return Err(ApiError::Validation("too many items (maximum 200)".into()));
    }

    let mut tx = state.db.pool().begin().await.map_err(crate::storage::DatabaseError::from)?;
    let mut ids = Vec::with_capacity(req.items.len());
    for item in &req.items {
        let id = create_user_request(
            &mut *tx,
            "bind",
            billing_username,
            &item.node_id,
            &item.local_username,
            &req.message,
        )
        .await?;
        ids.push(id);
    }
    tx.commit().await.map_err(crate::storage::DatabaseError::from)?;

    Ok(Json(serde_json::json!({ "ok": true, "request_ids": ids })))
}

#[derive(Debug, Deserialize)]
pub struct OpenRequestCreate {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub local_username: String,
    #[serde(default)]
    pub message: String,
}

/// `POST /api/requests/open` — request a new local account on a node.
pub async fn handle_open_request_create(
    State(state): State<AppState>,
    Json(req): Json<OpenRequestCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut tx = state.db.pool().begin().await.map_err(crate::storage::DatabaseError::from)?;
    let id = create_user_request(
        &mut *tx,
        "open",
        &req.billing_username,
        &req.node_id,
        &req.local_username,
        &req.message,
    )
    .await?;
    tx.commit().await.map_err(crate::storage::DatabaseError::from)?;
    Ok(Json(serde_json::json!({ "ok": true, "request_id": id })))
}

#[derive(Debug, Deserialize)]
pub struct RequestsListQuery {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub limit: i64,
}

/// `GET /api/requests` — a user's own bind/open requests.
pub async fn handle_requests_list(
    State(state): State<AppState>,
    Query(query): Query<RequestsListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requests = state
        .db
        .list_user_requests_by_billing(&query.billing_username, query.limit)
        .await?;
    Ok(Json(serde_json::json!({ "requests": requests })))
}

#[derive(Debug, Deserialize)]
pub struct ProfileChangeCreate {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub new_username: String,
    #[serde(default)]
    pub new_email: String,
    #[serde(default)]
    pub new_student_id: String,
    #[serde(default)]
    pub reason: String,
}

/// `POST /api/requests/profile-change` — request an identity change; the
/// rename cascade happens at admin approval.
pub async fn handle_profile_change_create(
    State(state): State<AppState>,
    Json(req): Json<ProfileChangeCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = state
        .db
        .create_profile_change_request(
            &req.billing_username,
            &req.new_username,
            &req.new_email,
            &req.new_student_id,
            &req.reason,
        )
        .await?;
    Ok(Json(serde_json::json!({ "ok": true, "request_id": id })))
}

/// `GET /api/requests/profile-change` — a user's own change requests.
pub async fn handle_profile_change_list(
    State(state): State<AppState>,
    Query(query): Query<RequestsListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requests = state
        .db
        .list_profile_change_requests_by_user(&query.billing_username, query.limit)
        .await?;
    Ok(Json(serde_json::json!({ "requests": requests })))
}

/// `GET /api/users/{username}/balance` — read (and on first sight, seed)
/// a billing user's balance.
pub async fn handle_balance(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let username = username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::Validation("username must not be empty".into()));
    }
    let mut tx = state.db.pool().begin().await.map_err(crate::storage::DatabaseError::from)?;
    let user = crate::storage::queries_users::ensure_user(
        &mut *tx,
        &username,
        state.config.default_balance,
    )
    .await?;
    tx.commit().await.map_err(crate::storage::DatabaseError::from)?;
    Ok(Json(serde_json::json!({
        "username": user.username,
        "balance": user.balance,
        "status": user.status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub limit: i64,
}

/// `GET /api/users/{username}/usage` — recent usage records for one user.
pub async fn handle_user_usage(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.db.list_usage_by_user(&username, query.limit).await?;
    Ok(Json(serde_json::json!({ "records": super::usage_views(records) })))
}

#[derive(Debug, Deserialize)]
pub struct RechargeBody {
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub method: String,
}

/// `POST /api/users/{username}/recharge` — admin credit onto a balance.
pub async fn handle_recharge(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(body): Json<RechargeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let username = username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::Validation("username must not be empty".into()));
    }
    let policy = crate::storage::BillingPolicy {
        default_balance: state.config.default_balance,
        warning_threshold: state.config.warning_threshold,
        limited_threshold: state.config.limited_threshold,
        dry_run: state.config.dry_run,
    };
    let mut tx = state.db.pool().begin().await.map_err(crate::storage::DatabaseError::from)?;
    let update = crate::storage::queries_users::recharge(
        &mut *tx,
        &username,
        body.amount,
        &body.method,
        unix_timestamp(),
        &policy,
    )
    .await?;
    tx.commit().await.map_err(crate::storage::DatabaseError::from)?;
    Ok(Json(serde_json::json!({
        "username": update.user.username,
        "balance": update.user.balance,
        "status": update.user.status,
    })))
}
