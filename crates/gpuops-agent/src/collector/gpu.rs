//! GPU sampling via `nvidia-smi`.
//!
//! Two queries: the device table (index, uuid, model, utilization) and the
//! compute-apps table (gpu uuid, pid, used memory), joined into one
//! per-process per-GPU row. A node without the tool reports no GPUs.

use std::collections::HashMap;
use std::time::Duration;

use gpuops_core::GpuUsage;
use tokio::process::Command;
use tracing::debug;

/// One physical GPU.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub index: i64,
    pub uuid: String,
    pub model: String,
    /// 0..1 fraction.
    pub utilization: f64,
}

/// The node's GPU picture for one tick.
#[derive(Debug, Clone, Default)]
pub struct GpuInventory {
    pub devices: Vec<GpuDevice>,
    /// pid -> per-GPU usage rows.
    pub by_pid: HashMap<i32, Vec<GpuUsage>>,
}

impl GpuInventory {
    pub fn model_summary(&self) -> String {
        self.devices.first().map(|d| d.model.clone()).unwrap_or_default()
    }

    pub fn device_count(&self) -> i64 {
        self.devices.len() as i64
    }
}

/// Sample the GPUs. Any failure (no driver, no tool) degrades to empty.
pub async fn sample_gpus(timeout: Duration) -> GpuInventory {
    let devices_csv = match run_nvidia_smi(
        &["--query-gpu=index,uuid,name,utilization.gpu", "--format=csv,noheader,nounits"],
        timeout,
    )
    .await
    {
        Some(out) => out,
        None => return GpuInventory::default(),
    };
    let devices = parse_device_table(&devices_csv);
    if devices.is_empty() {
        return GpuInventory::default();
    }

    let apps_csv = run_nvidia_smi(
        &["--query-compute-apps=gpu_uuid,pid,used_gpu_memory", "--format=csv,noheader,nounits"],
        timeout,
    )
    .await
    .unwrap_or_default();

    let by_pid = join_compute_apps(&devices, &apps_csv);
    GpuInventory { devices, by_pid }
}

async fn run_nvidia_smi(args: &[&str], timeout: Duration) -> Option<String> {
    let output = tokio::time::timeout(timeout, Command::new("nvidia-smi").args(args).output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        debug!(status = ?output.status, "nvidia-smi exited nonzero");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `index, uuid, name, utilization.gpu` CSV rows.
pub fn parse_device_table(csv: &str) -> Vec<GpuDevice> {
    csv.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GpuDevice {
                index: fields[0].parse().ok()?,
                uuid: fields[1].to_string(),
                model: fields[2].to_string(),
                utilization: fields[3].parse::<f64>().ok()? / 100.0,
            })
        })
        .collect()
}

/// Join `gpu_uuid, pid, used_gpu_memory` rows against the device table.
pub fn join_compute_apps(devices: &[GpuDevice], csv: &str) -> HashMap<i32, Vec<GpuUsage>> {
    let by_uuid: HashMap<&str, &GpuDevice> =
        devices.iter().map(|d| (d.uuid.as_str(), d)).collect();

    let mut by_pid: HashMap<i32, Vec<GpuUsage>> = HashMap::new();
    for line in csv.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            continue;
        }
        let Some(device) = by_uuid.get(fields[0]) else {
            continue;
        };
        let Ok(pid) = fields[1].parse::<i32>() else {
            continue;
        };
        let memory_mb = fields[2].parse::<f64>().unwrap_or(0.0);
        by_pid.entry(pid).or_default().push(GpuUsage {
            gpu_index: device.index,
            model: device.model.clone(),
            utilization: device.utilization,
            memory_mb,
        });
    }
    by_pid
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = "\
0, GPU-aaa, NVIDIA A100-SXM4-80GB, 97
1, GPU-bbb, NVIDIA A100-SXM4-80GB, 0
";

    #[test]
    fn device_table_parses_percent_as_fraction() {
        let devices = parse_device_table(DEVICES);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].model, "NVIDIA A100-SXM4-80GB");
        assert!((devices[0].utilization - 0.97).abs() < 1e-9);
        assert_eq!(devices[1].utilization, 0.0);
    }

    #[test]
    fn compute_apps_join_on_uuid() {
        let devices = parse_device_table(DEVICES);
        let apps = "GPU-aaa, 4242, 8192\nGPU-bbb, 4242, 1024\nGPU-zzz, 9, 1\n";
        let by_pid = join_compute_apps(&devices, apps);

        let rows = &by_pid[&4242];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].gpu_index, 0);
        assert_eq!(rows[0].memory_mb, 8192.0);
        assert_eq!(rows[1].gpu_index, 1);
        // Unknown uuid rows are dropped.
        assert!(!by_pid.contains_key(&9));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_device_table("garbage\n,,\n").is_empty());
        let devices = parse_device_table(DEVICES);
        assert!(join_compute_apps(&devices, "nonsense").is_empty());
    }
}
