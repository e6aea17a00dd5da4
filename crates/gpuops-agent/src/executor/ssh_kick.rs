//! SSH session termination.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::collector::{EXEMPT_USERS_FILE, load_exempt_users};

use super::ExecuteError;

const WHO_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminate every non-exempt login session on the node.
pub async fn kick_ssh_all(reason: &str) -> Result<(), ExecuteError> {
    let exempt = load_exempt_users(Path::new(EXEMPT_USERS_FILE));
    let ttys = session_ttys(None, &exempt).await?;
    let mut killed = 0;
    for tty in &ttys {
        if kill_tty(tty).await {
            killed += 1;
        }
    }
    info!(killed, reason, "kick_ssh_all executed");
    Ok(())
}

/// Terminate one user's login sessions. Falls back to killing the user's
/// `sshd: user@...` session processes when no tty was found for them.
pub async fn kick_ssh_user(username: &str, reason: &str) -> Result<(), ExecuteError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ExecuteError::EmptyUsername);
    }
    let exempt = load_exempt_users(Path::new(EXEMPT_USERS_FILE));
    if exempt.contains(username) {
        return Ok(());
    }

    let ttys = session_ttys(Some(username), &exempt).await?;
    let mut killed = 0;
    for tty in &ttys {
        if kill_tty(tty).await {
            killed += 1;
        }
    }

    // Some sessions carry no tty; clean up their sshd processes directly.
    let pattern = format!("^sshd: {username}@");
    let _ = Command::new("pkill").args(["-KILL", "-f", &pattern]).status().await;

    info!(username, killed, reason, "kick_ssh_user executed");
    Ok(())
}

/// Ttys with a live session, optionally filtered to one user, excluding the
/// exempt set.
async fn session_ttys(
    username: Option<&str>,
    exempt: &BTreeSet<String>,
) -> Result<BTreeSet<String>, ExecuteError> {
    let output = tokio::time::timeout(WHO_TIMEOUT, Command::new("who").output())
        .await
        .map_err(|_| ExecuteError::Subprocess("who timed out".to_string()))??;
    if !output.status.success() {
        return Err(ExecuteError::Subprocess(format!("who exited with {}", output.status)));
    }
    Ok(parse_session_ttys(&String::from_utf8_lossy(&output.stdout), username, exempt))
}

fn parse_session_ttys(
    who_output: &str,
    username: Option<&str>,
    exempt: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut ttys = BTreeSet::new();
    for line in who_output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(user), Some(tty)) = (fields.next(), fields.next()) else {
            continue;
        };
        if exempt.contains(user) {
            continue;
        }
        if let Some(wanted) = username {
            if user != wanted {
                continue;
            }
        }
        ttys.insert(tty.to_string());
    }
    ttys
}

async fn kill_tty(tty: &str) -> bool {
    match Command::new("pkill").args(["-KILL", "-t", tty]).status().await {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(tty, error = %e, "pkill failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHO: &str = "\
alice    pts/0        2026-08-01 09:12 (10.0.0.5)
bob      pts/1        2026-08-01 10:03 (10.0.0.6)
alice    pts/2        2026-08-01 10:40 (10.0.0.5)
root     tty1         2026-08-01 08:00
";

    fn exempt() -> BTreeSet<String> {
        BTreeSet::from(["root".to_string()])
    }

    #[test]
    fn all_sessions_except_exempt() {
        let ttys = parse_session_ttys(WHO, None, &exempt());
        assert_eq!(ttys, BTreeSet::from(["pts/0".into(), "pts/1".into(), "pts/2".into()]));
    }

    #[test]
    fn filtered_to_one_user() {
        let ttys = parse_session_ttys(WHO, Some("alice"), &exempt());
        assert_eq!(ttys, BTreeSet::from(["pts/0".into(), "pts/2".into()]));
    }

    #[test]
    fn exempt_user_yields_nothing() {
        let ttys = parse_session_ttys(WHO, Some("root"), &exempt());
        assert!(ttys.is_empty());
    }
}
