//! Two-phase process termination with ownership re-verification.
//!
//! A pid can be recycled at any time, so ownership is re-read from `/proc`
//! immediately before each signal phase; nothing is cached across the grace
//! sleep. A pid whose current owner is not the target user is never
//! signalled.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, Uid, User};
use tracing::{debug, info, warn};

use super::ExecuteError;

const TERM_GRACE: Duration = Duration::from_secs(5);

/// SIGTERM the pids still owned by `username`, wait, then SIGKILL whatever
/// of them survived and still belongs to the user.
pub async fn kill_processes(
    username: &str,
    pids: &[i32],
    reason: &str,
) -> Result<(), ExecuteError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ExecuteError::EmptyUsername);
    }
    if pids.is_empty() {
        return Ok(());
    }

    info!(username, ?pids, reason, "terminating processes");

    for &pid in pids {
        if !owned_by(pid, username) {
            debug!(pid, "skipped: pid no longer owned by target user");
            continue;
        }
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed (process may have exited)");
        }
    }

    // Give processes a chance to exit cleanly before the hard kill.
    tokio::time::sleep(TERM_GRACE).await;

    for &pid in pids {
        if !owned_by(pid, username) {
            continue;
        }
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            warn!(pid, error = %e, "SIGKILL failed");
        }
    }

    Ok(())
}

/// Whether the process currently belongs to the named user, read fresh from
/// `/proc/<pid>`.
fn owned_by(pid: i32, username: &str) -> bool {
    if pid <= 0 {
        return false;
    }
    let Ok(meta) = std::fs::metadata(Path::new("/proc").join(pid.to_string())) else {
        return false;
    };
    match User::from_uid(Uid::from_raw(meta.uid())) {
        Ok(Some(user)) => user.name == username,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_pid_is_not_owned() {
        // Pid 0 and a hopefully-unused huge pid both read as unowned.
        assert!(!owned_by(0, "root"));
        assert!(!owned_by(i32::MAX, "root"));
    }

    #[tokio::test]
    async fn empty_pid_list_is_a_noop() {
        kill_processes("alice", &[], "test").await.unwrap();
    }

    #[tokio::test]
    async fn empty_username_is_rejected() {
        let err = kill_processes(" ", &[1], "test").await;
        assert!(matches!(err, Err(ExecuteError::EmptyUsername)));
    }
}
