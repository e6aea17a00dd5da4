//! Logged-in SSH user discovery via `who`.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::process::Command;

/// Users with a live login session, sorted and de-duplicated, excluding
/// root and the given exempt set.
pub async fn sample_ssh_users(exempt: &BTreeSet<String>, timeout: Duration) -> Vec<String> {
    let output =
        match tokio::time::timeout(timeout, Command::new("who").output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            _ => return Vec::new(),
        };
    parse_who(&String::from_utf8_lossy(&output.stdout), exempt)
}

pub fn parse_who(output: &str, exempt: &BTreeSet<String>) -> Vec<String> {
    let mut users = BTreeSet::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(user), Some(_tty)) = (fields.next(), fields.next()) else {
            continue;
        };
        if user == "root" || exempt.contains(user) {
            continue;
        }
        users.insert(user.to_string());
    }
    users.into_iter().collect()
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

    #[test]
    fn deduplicates_and_sorts_users() {
        let users = parse_who(WHO, &BTreeSet::new());
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn excludes_root_and_exempt_set() {
        let exempt = BTreeSet::from(["bob".to_string()]);
        let users = parse_who(WHO, &exempt);
        assert_eq!(users, vec!["alice"]);
    }

    #[test]
    fn tolerates_short_lines() {
        assert!(parse_who("justone\n\n", &BTreeSet::new()).is_empty());
    }
}
