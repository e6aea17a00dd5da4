//! Process sampling from `/proc`.
//!
//! CPU usage is an interval delta: the scanner remembers each pid's
//! cumulative CPU ticks and converts the movement since the previous sample
//! into a per-core percentage (0..N*100). A pid seen for the first time
//! reads as 0% and starts contributing on the next tick.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use nix::unistd::{SysconfVar, Uid, User, sysconf};
use tracing::trace;

/// One process observed in a scan, before GPU data is attached.
#[derive(Debug, Clone)]
pub struct ScannedProcess {
    pub pid: i32,
    pub username: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub command: String,
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    total_ticks: u64,
    sampled_at: Instant,
}

/// Scans `/proc` and tracks per-pid CPU tick counters across calls.
#[derive(Debug, Default)]
pub struct ProcScanner {
    last: HashMap<i32, CpuSample>,
}

impl ProcScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan every live process. Kernel threads (no cmdline) are skipped.
    pub fn scan(&mut self) -> Vec<ScannedProcess> {
        self.scan_root(Path::new("/proc"))
    }

    fn scan_root(&mut self, root: &Path) -> Vec<ScannedProcess> {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut seen: HashMap<i32, CpuSample> = HashMap::new();

        let Ok(entries) = std::fs::read_dir(root) else {
            return out;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let proc_dir = entry.path();

            let Ok(stat) = std::fs::read_to_string(proc_dir.join("stat")) else {
                continue;
            };
            let Some(total_ticks) = parse_stat_ticks(&stat) else {
                continue;
            };

            let command = std::fs::read_to_string(proc_dir.join("cmdline"))
                .map(|raw| raw.replace('\0', " ").trim().to_string())
                .unwrap_or_default();
            if command.is_empty() {
                // Kernel thread.
                continue;
            }

            let Ok(meta) = std::fs::metadata(&proc_dir) else {
                continue;
            };
            let username = match User::from_uid(Uid::from_raw(meta.uid())) {
                Ok(Some(user)) => user.name,
                _ => continue,
            };

            let memory_mb = std::fs::read_to_string(proc_dir.join("statm"))
                .ok()
                .and_then(|statm| parse_statm_resident_mb(&statm, page_size()))
                .unwrap_or(0.0);

            let cpu_percent = match self.last.get(&pid) {
                Some(prev) => {
                    cpu_percent_between(prev.total_ticks, total_ticks, prev.sampled_at.elapsed())
                }
                None => 0.0,
            };
            seen.insert(pid, CpuSample { total_ticks, sampled_at: now });

            out.push(ScannedProcess { pid, username, cpu_percent, memory_mb, command });
        }

        trace!(processes = out.len(), "scanned /proc");
        // Forget exited pids so a recycled pid never inherits old ticks.
        self.last = seen;
        out
    }
}

/// Per-core CPU percentage for a tick delta over a wall-clock span.
fn cpu_percent_between(prev_ticks: u64, current_ticks: u64, elapsed: std::time::Duration) -> f64 {
    let wall_secs = elapsed.as_secs_f64();
    if wall_secs <= 0.0 || current_ticks < prev_ticks {
        return 0.0;
    }
    let cpu_secs = (current_ticks - prev_ticks) as f64 / clk_tck();
    (cpu_secs / wall_secs) * 100.0
}

/// Sum of utime and stime from `/proc/<pid>/stat`.
///
/// The comm field may itself contain spaces or parentheses, so fields are
/// counted from the last `)`.
pub fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // Field 14 (utime) is the 12th after comm; state is the first.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

/// Resident set size in MiB from `/proc/<pid>/statm`.
pub fn parse_statm_resident_mb(statm: &str, page_size: u64) -> Option<f64> {
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some((resident_pages * page_size) as f64 / 1024.0 / 1024.0)
}

fn clk_tck() -> f64 {
    static CLK_TCK: OnceLock<f64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        _ => 100.0,
    })
}

fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    })
}
