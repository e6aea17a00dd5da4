//! Action execution against the local OS.

mod kill;
mod ssh_kick;

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use gpuops_core::Action;
use nix::unistd::User;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

pub use kill::kill_processes;
pub use ssh_kick::{kick_ssh_all, kick_ssh_user};

/// Flag file GPU launchers check before starting a job.
pub const BLOCKED_FILE: &str = ".gpu_blocked";
/// Notice file surfaced to the user at login.
pub const NOTICE_FILE: &str = ".gpu_notice";

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("username must not be empty")]
    EmptyUsername,

    #[error("unknown local user {0}")]
    UnknownUser(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subprocess failed: {0}")]
    Subprocess(String),
}

/// Executes controller actions on this node.
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, action: &Action) -> Result<(), ExecuteError> {
        match action {
            Action::Notify { username, message } => write_notice(username, message),
            Action::BlockUser { username, reason } => block_user(username, reason),
            Action::UnblockUser { username } => unblock_user(username),
            Action::SetCpuQuota { username, cpu_quota_percent, reason } => {
                set_cpu_quota(username, *cpu_quota_percent, reason).await
            }
            Action::KillProcess { username, pids, reason } => {
                kill_processes(username, pids, reason).await
            }
            Action::KickSshAll { reason } => kick_ssh_all(reason).await,
            Action::KickSshUser { username, reason } => kick_ssh_user(username, reason).await,
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

fn home_dir(username: &str) -> Result<PathBuf, ExecuteError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ExecuteError::EmptyUsername);
    }
    Ok(Path::new("/home").join(username))
}

fn write_user_file(path: &Path, content: &str) -> Result<(), ExecuteError> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Write a timestamped notice into the user's home.
fn write_notice(username: &str, message: &str) -> Result<(), ExecuteError> {
    if username.trim().is_empty() || message.trim().is_empty() {
        return Ok(());
    }
    let path = home_dir(username)?.join(NOTICE_FILE);
    write_user_file(&path, &format!("{}\n{}\n", Utc::now().to_rfc3339(), message))
}

/// Drop the cooperative block flag. GPU jobs check this file before start.
fn block_user(username: &str, reason: &str) -> Result<(), ExecuteError> {
    let path = home_dir(username)?.join(BLOCKED_FILE);
    let reason =
        if reason.trim().is_empty() { "balance exhausted, new GPU tasks blocked" } else { reason };
    info!(username, "blocking GPU access");
    write_user_file(&path, &format!("{reason}\n"))
}

/// Remove the block flag; a missing file is not an error.
fn unblock_user(username: &str) -> Result<(), ExecuteError> {
    let path = home_dir(username)?.join(BLOCKED_FILE);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            info!(username, "unblocked GPU access");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Apply (percent > 0) or clear (percent == 0) a user-level CPU quota via
/// the user's systemd slice.
async fn set_cpu_quota(username: &str, percent: u32, reason: &str) -> Result<(), ExecuteError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ExecuteError::EmptyUsername);
    }
    let user = User::from_name(username)
        .map_err(|e| ExecuteError::Subprocess(e.to_string()))?
        .ok_or_else(|| ExecuteError::UnknownUser(username.to_string()))?;

    let slice = format!("user-{}.slice", user.uid.as_raw());
    // An empty value clears the property.
    let quota = if percent == 0 { "CPUQuota=".to_string() } else { format!("CPUQuota={percent}%") };

    info!(username, percent, reason, "applying CPU quota");
    let status = Command::new("systemctl")
        .args(["set-property", "--runtime", &slice, &quota])
        .status()
        .await?;
    if !status.success() {
        warn!(username, %status, "systemctl set-property failed");
        return Err(ExecuteError::Subprocess(format!(
            "systemctl set-property exited with {status}"
        )));
    }
    Ok(())
}
