//! Metric-report and registry wire types.

use serde::{Deserialize, Serialize};

/// One metric submission from a node agent.
///
/// `report_id` is generated by the agent per tick and is the controller's
/// idempotency key: a retried upload carries the same id and must not bill
/// twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricReport {
    pub node_id: String,
    pub report_id: String,
    /// RFC3339; the controller falls back to its own clock when unparsable.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub interval_seconds: i64,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub cpu_count: i64,
    #[serde(default)]
    pub gpu_model: String,
    #[serde(default)]
    pub gpu_count: i64,
    #[serde(default)]
    pub net_rx_bytes: u64,
    #[serde(default)]
    pub net_tx_bytes: u64,
    #[serde(default)]
    pub ssh_users: Vec<String>,
    #[serde(default)]
    pub users: Vec<ProcessSample>,
}

/// One process observed on the node during the sample interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSample {
    pub username: String,
    pub pid: i32,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub gpu_usage: Vec<GpuUsage>,
}

/// Per-GPU share of a process. `utilization` is a 0..1 fraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuUsage {
    pub gpu_index: i64,
    pub model: String,
    pub utilization: f64,
    pub memory_mb: f64,
}

/// Response body for `GET /api/registry/resolve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_username: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub whitelisted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blacklisted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exempted: bool,
}
