//! HTTP surface of the controller.

pub mod admin;
pub mod agent;
pub mod auth;
pub mod lists;
pub mod registry;
pub mod requests;

use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};

use crate::auth::SessionKeys;
use crate::config::ControllerConfig;
use crate::metrics::ControllerMetrics;
use crate::outbox::ActionOutbox;
use crate::storage::{Database, UsageRecord};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<ControllerConfig>,
    pub outbox: Arc<ActionOutbox>,
    pub metrics: Arc<ControllerMetrics>,
    /// Session verification keys; `None` when cookie auth is disabled.
    pub sessions: Option<Arc<SessionKeys>>,
}

impl AppState {
    pub fn new(db: Database, config: ControllerConfig) -> Self {
        let sessions = (!config.auth_secret.is_empty() && config.session_hours > 0)
            .then(|| Arc::new(SessionKeys::new(config.auth_secret.as_bytes(), config.session_hours)));
        Self {
            db,
            config: Arc::new(config),
            outbox: Arc::new(ActionOutbox::new()),
            metrics: Arc::new(ControllerMetrics::new()),
            sessions,
        }
    }
}

/// Assemble the full controller router.
pub fn build_router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/metrics", post(agent::handle_metrics))
        .route("/node/actions", get(agent::handle_node_actions))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_agent));

    let recharge_routes = Router::new()
        .route("/users/:username/recharge", post(registry::handle_recharge))
        .route_layer(middleware::from_fn(auth::require_super_admin))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    let admin_super = Router::new()
        .route("/users", get(admin::users_list))
        .route("/prices", get(admin::prices_list).post(admin::prices_set))
        .route("/usage", get(admin::usage_list))
        .route(
            "/accounts",
            get(admin::accounts_list)
                .post(admin::accounts_upsert)
                .put(admin::accounts_update)
                .delete(admin::accounts_delete),
        )
        .route(
            "/whitelist",
            get(lists::whitelist_list)
                .post(lists::whitelist_upsert)
                .delete(lists::whitelist_delete),
        )
        .route(
            "/blacklist",
            get(lists::blacklist_list)
                .post(lists::blacklist_upsert)
                .delete(lists::blacklist_delete),
        )
        .route(
            "/exemptions",
            get(lists::exemptions_list)
                .post(lists::exemptions_upsert)
                .delete(lists::exemptions_delete),
        )
        .route("/user-accounts", post(admin::user_accounts_create))
        .route("/user-accounts/:username", get(admin::user_accounts_get))
        .route("/power-users", get(admin::power_users_list).post(admin::power_users_create))
        .route("/power-users/:username/permissions", put(admin::power_users_update_permissions))
        .route("/power-users/:username", delete(admin::power_users_delete))
        .route("/nodes/:id/ssh/disconnect-all", post(admin::node_disconnect_all))
        .route_layer(middleware::from_fn(auth::require_super_admin));

    let admin_review = Router::new()
        .route("/requests", get(requests::admin_requests_list))
        .route("/requests/:id/approve", post(requests::admin_request_approve))
        .route("/requests/:id/reject", post(requests::admin_request_reject))
        .route("/profile-change-requests", get(requests::profile_changes_list))
        .route("/profile-change-requests/:id/approve", post(requests::profile_change_approve))
        .route("/profile-change-requests/:id/reject", post(requests::profile_change_reject))
        .route_layer(middleware::from_fn(auth::require_review_permission));

    let admin_nodes = Router::new()
        .route("/nodes", get(admin::nodes_list))
        .route_layer(middleware::from_fn(auth::require_nodes_permission));

    let admin_routes = admin_super
        .merge(admin_review)
        .merge(admin_nodes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    let api = Router::new()
        .route("/registry/resolve", get(registry::handle_resolve))
        .route("/registry/nodes/:node_id/users.txt", get(registry::handle_node_users_txt))
        .route("/registry/nodes/:node_id/blocked.txt", get(registry::handle_node_blocked_txt))
        .route("/registry/nodes/:node_id/exempt.txt", get(registry::handle_node_exempt_txt))
        .route("/requests", get(registry::handle_requests_list))
        .route("/requests/bind", post(registry::handle_bind_requests_create))
        .route("/requests/open", post(registry::handle_open_request_create))
        .route(
            "/requests/profile-change",
            get(registry::handle_profile_change_list).post(registry::handle_profile_change_create),
        )
        .route("/users/:username/balance", get(registry::handle_balance))
        .route("/users/:username/usage", get(registry::handle_user_usage))
        .merge(agent_routes)
        .merge(recharge_routes)
        .nest("/admin", admin_routes);

    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/metrics", get(handle_metrics_text))
        .nest("/api", api)
        .with_state(state)
}

async fn handle_healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn handle_metrics_text(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    let body = state.metrics.render(state.outbox.pending_total());
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

/// Render usage records for API responses, with `gpu_usage` as parsed JSON
/// rather than the stored string.
pub(crate) fn usage_views(records: Vec<UsageRecord>) -> Vec<serde_json::Value> {
    records
        .into_iter()
        .map(|record| {
            let gpu_usage: serde_json::Value =
                serde_json::from_str(&record.gpu_usage).unwrap_or_else(|_| serde_json::json!([]));
            serde_json::json!({
                "node_id": record.node_id,
                "local_username": record.local_username,
                "username": record.username,
                "timestamp": record.timestamp,
                "pid": record.pid,
                "cpu_percent": record.cpu_percent,
                "memory_mb": record.memory_mb,
                "gpu_count": record.gpu_count,
                "command": record.command,
                "gpu_usage": gpu_usage,
                "cost": record.cost,
            })
        })
        .collect()
}
