//! Sample collection and report assembly.

pub mod gpu;
pub mod net;
pub mod proc;
pub mod ssh;

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use gpuops_core::{MetricReport, ProcessSample};
use tracing::debug;

use proc::ProcScanner;

/// Path listing local users the agent never kicks and never reports as SSH
/// sessions.
pub const EXEMPT_USERS_FILE: &str = "/var/lib/gpu-cluster/exempt_users.txt";

/// Collects one report per tick, keeping CPU counters between ticks.
pub struct Collector {
    node_id: String,
    cpu_min_percent: f64,
    scanner: ProcScanner,
}

impl Collector {
    pub fn new(node_id: String, cpu_min_percent: f64) -> Self {
        Self { node_id, cpu_min_percent, scanner: ProcScanner::new() }
    }

    /// Assemble one report. `interval_seconds` is the configured tick length
    /// the controller bills against.
    pub async fn collect(&mut self, interval_seconds: i64) -> MetricReport {
        let subprocess_timeout = Duration::from_secs(10);

        let gpus = gpu::sample_gpus(subprocess_timeout).await;
        let scanned = self.scanner.scan();
        let (net_rx_bytes, net_tx_bytes) = net::read_net_totals();
        let exempt = load_exempt_users(Path::new(EXEMPT_USERS_FILE));
        let ssh_users = ssh::sample_ssh_users(&exempt, subprocess_timeout).await;

        // Idle CPU-only processes are dropped before transmission; the
        // controller applies its own noise floor on top.
        let users: Vec<ProcessSample> = scanned
            .into_iter()
            .filter_map(|process| {
                let gpu_usage = gpus.by_pid.get(&process.pid).cloned().unwrap_or_default();
                if gpu_usage.is_empty() && process.cpu_percent < self.cpu_min_percent {
                    return None;
                }
                Some(ProcessSample {
                    username: process.username,
                    pid: process.pid,
                    cpu_percent: process.cpu_percent,
                    memory_mb: process.memory_mb,
                    command: process.command,
                    gpu_usage,
                })
            })
            .collect();

        debug!(
            node_id = self.node_id.as_str(),
            processes = users.len(),
            gpus = gpus.device_count(),
            ssh = ssh_users.len(),
            "collected sample"
        );

        MetricReport {
            node_id: self.node_id.clone(),
            report_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            interval_seconds,
            cpu_model: read_cpu_model(),
            cpu_count: available_cpus(),
            gpu_model: gpus.model_summary(),
            gpu_count: gpus.device_count(),
            net_rx_bytes,
            net_tx_bytes,
            ssh_users,
            users,
        }
    }
}

/// Local users exempt from enforcement: root plus the exempt file.
pub fn load_exempt_users(path: &Path) -> BTreeSet<String> {
    let mut exempt = BTreeSet::from(["root".to_string()]);
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let user = line.trim();
            if !user.is_empty() {
                exempt.insert(user.to_string());
            }
        }
    }
    exempt
}

fn read_cpu_model() -> String {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return String::new();
    };
    cpuinfo
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, model)| model.trim().to_string())
        .unwrap_or_default()
}

fn available_cpus() -> i64 {
    std::thread::available_parallelism().map(|n| n.get() as i64).unwrap_or(0)
}
