//! Data models for GPUOPS controller storage.

use serde::{Deserialize, Serialize};

/// A billing account. Implicitly created on first sight.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub username: String,
    pub balance: f64,
    pub status: String,
    pub blocked_at: Option<i64>,
    pub last_charge_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The human identity behind a self-registered billing account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserAccount {
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub real_name: String,
    pub student_id: String,
    pub advisor: String,
    pub expected_graduation_year: i64,
    pub phone: String,
    pub role: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Operator account with a restricted permission set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PowerUser {
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub can_view_board: bool,
    pub can_view_nodes: bool,
    pub can_review_requests: bool,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// (node, local OS account) -> billing account binding.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserNodeAccount {
    pub node_id: String,
    pub local_username: String,
    pub billing_username: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One row of an SSH list (whitelist, blacklist or exemption).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SshListEntry {
    pub node_id: String,
    pub local_username: String,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One billed process observation. `username` is the billing account,
/// `local_username` the OS account that ran the process.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub id: i64,
    pub node_id: String,
    pub local_username: String,
    pub username: String,
    pub timestamp: i64,
    pub pid: i64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub gpu_count: i64,
    pub command: String,
    /// JSON array of per-GPU usage, `[]` for CPU-only records.
    pub gpu_usage: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RechargeRecord {
    pub id: i64,
    pub username: String,
    pub amount: f64,
    pub method: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PriceRow {
    pub gpu_model: String,
    pub price_per_minute: f64,
}

/// Rolling per-node status, updated at the end of every admitted report.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeStatus {
    pub node_id: String,
    pub last_seen_at: i64,
    pub last_report_id: String,
    pub last_report_ts: i64,
    pub interval_seconds: i64,
    pub cpu_model: String,
    pub cpu_count: i64,
    pub gpu_model: String,
    pub gpu_count: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub net_rx_mb_month: f64,
    pub net_tx_mb_month: f64,
    pub traffic_month: String,
    pub gpu_process_count: i64,
    pub cpu_process_count: i64,
    pub usage_records_count: i64,
    pub ssh_active_count: i64,
    pub cost_total: f64,
    pub updated_at: i64,
}

/// Self-service bind/open request awaiting admin review.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRequest {
    pub request_id: i64,
    pub request_type: String,
    pub billing_username: String,
    pub node_id: String,
    pub local_username: String,
    pub message: String,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Identity-change request; approval cascades the rename.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileChangeRequest {
    pub request_id: i64,
    pub billing_username: String,
    pub old_username: String,
    pub old_email: String,
    pub old_student_id: String,
    pub new_username: String,
    pub new_email: String,
    pub new_student_id: String,
    pub reason: String,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
