//! Admin endpoints: users, prices, bindings, nodes and power users.

use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query, State};
use gpuops_core::Action;
use serde::Deserialize;

use crate::error::ApiError;

use super::AppState;
use super::auth::AuthContext;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: i64,
}

/// `GET /api/admin/users` — billing users with balance and status.
pub async fn users_list(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let users = state.db.list_users(query.limit).await?;
    Ok(Json(serde_json::json!({ "users": users })))
}

/// `GET /api/admin/prices`
pub async fn prices_list(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let prices = state.db.list_prices().await?;
    Ok(Json(serde_json::json!({ "prices": prices })))
}

#[derive(Debug, Deserialize)]
pub struct SetPrice {
    #[serde(default)]
    pub gpu_model: String,
    #[serde(default)]
    pub price_per_minute: f64,
}

/// `POST /api/admin/prices` — upsert one resource price.
pub async fn prices_set(
    State(state): State<AppState>,
    Json(req): Json<SetPrice>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.db.upsert_price(&req.gpu_model, req.price_per_minute).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct UsageAdminQuery {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub local_username: String,
    #[serde(default)]
    pub unregistered_only: String,
    #[serde(default)]
    pub limit: i64,
}

/// `GET /api/admin/usage` — usage records with admin filters.
pub async fn usage_list(
    State(state): State<AppState>,
    Query(query): Query<UsageAdminQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state
        .db
        .list_usage_admin(
            &query.billing_username,
            &query.local_username,
            query.unregistered_only.trim() == "1",
            query.limit,
        )
        .await?;
    Ok(Json(serde_json::json!({ "records": super::usage_views(records) })))
}

#[derive(Debug, Deserialize)]
pub struct AccountsQuery {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub limit: i64,
}

/// `GET /api/admin/accounts` — bindings, optionally for one billing user.
pub async fn accounts_list(
    State(state): State<AppState>,
    Query(query): Query<AccountsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accounts = state
        .db
        .list_user_node_accounts(&query.billing_username, query.limit)
        .await?;
    Ok(Json(serde_json::json!({ "accounts": accounts })))
}

#[derive(Debug, Deserialize)]
pub struct AccountUpsert {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub local_username: String,
}

/// `POST /api/admin/accounts` — create or repoint a binding.
pub async fn accounts_upsert(
    State(state): State<AppState>,
    Json(req): Json<AccountUpsert>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .upsert_user_node_account(&req.node_id, &req.local_username, &req.billing_username)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct AccountUpdate {
    #[serde(default)]
    pub old_billing_username: String,
    #[serde(default)]
    pub old_node_id: String,
    #[serde(default)]
    pub old_local_username: String,
    #[serde(default)]
    pub new_billing_username: String,
    #[serde(default)]
    pub new_node_id: String,
    #[serde(default)]
    pub new_local_username: String,
}

/// `PUT /api/admin/accounts` — move a binding.
pub async fn accounts_update(
    State(state): State<AppState>,
    Json(req): Json<AccountUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .update_user_node_account(
            &req.old_node_id,
            &req.old_local_username,
            &req.old_billing_username,
            &req.new_node_id,
            &req.new_local_username,
            &req.new_billing_username,
        )
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct AccountDelete {
    #[serde(default)]
    pub billing_username: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub local_username: String,
}

/// `DELETE /api/admin/accounts`
pub async fn accounts_delete(
    State(state): State<AppState>,
    Query(query): Query<AccountDelete>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .delete_user_node_account(&query.node_id, &query.local_username, &query.billing_username)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `GET /api/admin/nodes` — node statuses for the operations view.
pub async fn nodes_list(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let nodes = state.db.list_nodes(query.limit).await?;
    Ok(Json(serde_json::json!({ "nodes": nodes })))
}

/// `POST /api/admin/nodes/{id}/ssh/disconnect-all` — queue a node-wide SSH
/// kick for the node's next contact.
pub async fn node_disconnect_all(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(node_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let node_id = node_id.trim().to_string();
    if node_id.is_empty() {
        return Err(ApiError::Validation("node_id must not be empty".into()));
    }
    let node = state.db.get_node_status(&node_id).await?;
    let operator = auth.operator().to_string();
    state.outbox.enqueue(
        &node_id,
        Action::KickSshAll {
            reason: format!("operator {operator} requested an SSH sweep of the node"),
        },
    );
    Ok(Json(serde_json::json!({
        "ok": true,
        "node_id": node_id,
        "ssh_active_count": node.ssh_active_count,
        "requested_by": operator,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UserAccountCreate {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub advisor: String,
    #[serde(default)]
    pub expected_graduation_year: i64,
    #[serde(default)]
    pub phone: String,
}

/// `POST /api/admin/user-accounts` — register an identity by admin fiat and
/// seed its billing user.
pub async fn user_accounts_create(
    State(state): State<AppState>,
    Json(req): Json<UserAccountCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .create_user_account(
            &crate::storage::NewUserAccount {
                username: req.username,
                email: req.email,
                real_name: req.real_name,
                student_id: req.student_id,
                advisor: req.advisor,
                expected_graduation_year: req.expected_graduation_year,
                phone: req.phone,
            },
            &req.password,
            state.config.default_balance,
        )
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `GET /api/admin/user-accounts/{username}` — the registered identity
/// behind a billing user, for request review.
pub async fn user_accounts_get(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state.db.get_user_account(&username).await?;
    Ok(Json(serde_json::json!({ "account": account })))
}

#[derive(Debug, Deserialize)]
pub struct PowerUserCreate {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub can_view_board: bool,
    #[serde(default)]
    pub can_view_nodes: bool,
    #[serde(default)]
    pub can_review_requests: bool,
}

/// `GET /api/admin/power-users`
pub async fn power_users_list(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let users = state.db.list_power_users(query.limit).await?;
    Ok(Json(serde_json::json!({ "users": users })))
}

/// `POST /api/admin/power-users`
pub async fn power_users_create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<PowerUserCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .create_power_user(
            &req.username,
            &req.password,
            req.can_view_board,
            req.can_view_nodes,
            req.can_review_requests,
            auth.operator(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct PowerUserPerms {
    #[serde(default)]
    pub can_view_board: bool,
    #[serde(default)]
    pub can_view_nodes: bool,
    #[serde(default)]
    pub can_review_requests: bool,
}

/// `PUT /api/admin/power-users/{username}/permissions`
pub async fn power_users_update_permissions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(username): Path<String>,
    Json(req): Json<PowerUserPerms>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .update_power_user_permissions(
            &username,
            req.can_view_board,
            req.can_view_nodes,
            req.can_review_requests,
            auth.operator(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `DELETE /api/admin/power-users/{username}`
pub async fn power_users_delete(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.db.delete_power_user(&username).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
