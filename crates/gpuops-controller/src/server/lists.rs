//! Admin CRUD over the three SSH lists, plus the kick side effects.
//!
//! Blacklist additions and whitelist deletions enqueue `kick_ssh_user` on
//! every node that effectively lost the user, so a revoked account cannot
//! keep a live SSH session.

use axum::Extension;
use axum::Json;
use axum::extract::{Query, State};
use gpuops_core::Action;
use serde::Deserialize;

use crate::error::ApiError;
use crate::storage::{SshList, WILDCARD_NODE};

use super::AppState;
use super::auth::AuthContext;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListUpsert {
    #[serde(default)]
    pub node_id: String,
    /// Literal local usernames to add.
    #[serde(default)]
    pub usernames: Vec<String>,
    /// Billing usernames, expanded through their bindings on the node.
    #[serde(default)]
    pub billing_usernames: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListDelete {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub local_username: String,
}

/// One concrete (node, local) pair an upsert resolves to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ListEntry {
    node_id: String,
    local_username: String,
}

fn trim_uniq(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|seen| seen == item) {
            out.push(item.to_string());
        }
    }
    out
}

/// Expand an upsert request into concrete (node, local) entries.
///
/// Billing usernames map through their bindings, filtered to the requested
/// node (all bindings for the wildcard). A billing user with no matching
/// binding falls back to (node, billing-as-local).
async fn resolve_entries(state: &AppState, req: &ListUpsert) -> Result<Vec<ListEntry>, ApiError> {
    let node_id = req.node_id.trim();
    if node_id.is_empty() {
        return Err(ApiError::Validation("node_id must not be empty".into()));
    }
    let manual = trim_uniq(&req.usernames);
    let billing = trim_uniq(&req.billing_usernames);
    if manual.is_empty() && billing.is_empty() {
        return Err(ApiError::Validation(
            "usernames or billing_usernames must be provided".into(),
        ));
    }

    let mut entries: Vec<ListEntry> = Vec::new();
    let mut push = |node: &str, local: &str| {
        let entry = ListEntry { node_id: node.to_string(), local_username: local.to_string() };
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    };

    for local in &manual {
        push(node_id, local);
    }

    for billing_user in &billing {
        let accounts = state.db.list_user_node_accounts(billing_user, 5000).await?;
        let mut matched = 0;
        for account in &accounts {
            if node_id != WILDCARD_NODE && account.node_id != node_id {
                continue;
            }
            push(&account.node_id, &account.local_username);
            matched += 1;
        }
        if matched == 0 {
            push(node_id, billing_user);
        }
    }

    entries.sort();
    Ok(entries)
}

/// Expand a mix of node ids and the wildcard into concrete known nodes.
async fn expand_nodes(state: &AppState, node_ids: &[String]) -> std::collections::BTreeSet<String> {
    let mut targets = std::collections::BTreeSet::new();
    for node_id in node_ids {
        if node_id == WILDCARD_NODE {
            if let Ok(nodes) = state.db.list_nodes(5000).await {
                targets.extend(nodes.into_iter().map(|n| n.node_id));
            }
        } else {
            targets.insert(node_id.clone());
        }
    }
    targets
}

/// Queue `kick_ssh_user` for a (node, local) pair. The wildcard expands to
/// every known node; exempt users are left alone.
async fn enqueue_kick(state: &AppState, node_id: &str, local_username: &str, reason: &str) {
    let requested = [node_id.to_string()];
    let targets = expand_nodes(state, &requested).await;

    for target in targets {
        let exempted = state
            .db
            .is_listed(SshList::Exemption, &target, local_username)
            .await
            .unwrap_or(false);
        if exempted {
            continue;
        }
        state.outbox.enqueue(
            &target,
            Action::KickSshUser {
                username: local_username.to_string(),
                reason: reason.to_string(),
            },
        );
    }
}

async fn handle_list(
    state: AppState,
    list: SshList,
    query: ListQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.db.list_ssh_entries(list, &query.node_id, query.limit).await?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

async fn handle_upsert(
    state: AppState,
    list: SshList,
    auth: AuthContext,
    req: ListUpsert,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = resolve_entries(&state, &req).await?;
    let operator = auth.operator().to_string();

    let mut by_node: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for entry in &entries {
        by_node.entry(entry.node_id.clone()).or_default().push(entry.local_username.clone());
    }
    for (node_id, users) in &by_node {
        state.db.upsert_ssh_entries(list, node_id, users, &operator).await?;
    }

    // Newly blacklisted users lose their live sessions immediately.
    let mut kicked = false;
    if list == SshList::Blacklist {
        for entry in &entries {
            enqueue_kick(
                &state,
                &entry.node_id,
                &entry.local_username,
                &format!("operator {operator} added the account to the SSH blacklist"),
            )
            .await;
        }
        kicked = true;
    }

    Ok(Json(serde_json::json!({ "ok": true, "entries": entries.len(), "kicked": kicked })))
}

pub async fn whitelist_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle_list(state, SshList::Whitelist, query).await
}

pub async fn whitelist_upsert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ListUpsert>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle_upsert(state, SshList::Whitelist, auth, req).await
}

/// Deleting a whitelist entry kicks the user off every node that lost them
/// (the node itself, plus everywhere when the wildcard row went too).
pub async fn whitelist_delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListDelete>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let local_username = query.local_username.trim().to_string();
    let nodes = state
        .db
        .delete_ssh_entry_with_nodes(SshList::Whitelist, &query.node_id, &local_username)
        .await?;
    let operator = auth.operator().to_string();
    let reason = format!("operator {operator} removed the account from the SSH whitelist");

    // The affected set may contain both a node and the wildcard; expand and
    // dedupe so each node is kicked once.
    for target in expand_nodes(&state, &nodes).await {
        let exempted = state
            .db
            .is_listed(SshList::Exemption, &target, &local_username)
            .await
            .unwrap_or(false);
        if !exempted {
            state.outbox.enqueue(
                &target,
                Action::KickSshUser { username: local_username.clone(), reason: reason.clone() },
            );
        }
    }
    Ok(Json(serde_json::json!({ "ok": true, "kicked": true })))
}

pub async fn blacklist_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle_list(state, SshList::Blacklist, query).await
}

pub async fn blacklist_upsert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ListUpsert>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle_upsert(state, SshList::Blacklist, auth, req).await
}

pub async fn blacklist_delete(
    State(state): State<AppState>,
    Query(query): Query<ListDelete>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .delete_ssh_entry_with_nodes(SshList::Blacklist, &query.node_id, &query.local_username)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn exemptions_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle_list(state, SshList::Exemption, query).await
}

pub async fn exemptions_upsert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ListUpsert>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle_upsert(state, SshList::Exemption, auth, req).await
}

pub async fn exemptions_delete(
    State(state): State<AppState>,
    Query(query): Query<ListDelete>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .delete_ssh_entry_with_nodes(SshList::Exemption, &query.node_id, &query.local_username)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
