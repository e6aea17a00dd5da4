//! Action synthesis from status transitions.
//!
//! Turns (previous status, new status, owned pids) into the ordered action
//! list the node agent executes. Repeats of the same status emit nothing,
//! with one exception: a user who stays blocked re-runs the kill-schedule
//! check on every report so the kill fires once the grace period elapses.

use gpuops_core::Action;

use super::status::UserStatus;

/// CPU-throttle policy, present when `enable_cpu_control` is configured.
#[derive(Debug, Clone, Copy)]
pub struct CpuControl {
    pub limited_percent: u32,
    pub blocked_percent: u32,
}

/// One billing user's status transition, scoped to one local account.
///
/// Billing is per billing user, but actions must target the node-local
/// account or the agent cannot apply them.
#[derive(Debug)]
pub struct Transition<'a> {
    pub now: i64,
    pub prev_status: UserStatus,
    pub new_status: UserStatus,
    pub balance: f64,
    /// Moment the user entered blocked; set whenever new_status is blocked.
    pub blocked_at: Option<i64>,
    pub local_username: &'a str,
    pub pids: &'a [i32],
    pub grace_seconds: i64,
    pub cpu_control: Option<CpuControl>,
}

pub fn decide_actions(t: &Transition<'_>) -> Vec<Action> {
    let mut actions = Vec::new();
    let user = t.local_username;

    match t.new_status {
        UserStatus::Normal => {
            if t.prev_status != UserStatus::Normal {
                actions.push(Action::UnblockUser { username: user.to_string() });
                if t.cpu_control.is_some() {
                    actions.push(Action::SetCpuQuota {
                        username: user.to_string(),
                        cpu_quota_percent: 0,
                        reason: "balance restored, CPU limit lifted".to_string(),
                    });
                }
            }
        }
        UserStatus::Warning => {
            if t.prev_status != UserStatus::Warning {
                actions.push(Action::Notify {
                    username: user.to_string(),
                    message: format!("Balance low ({:.4}); please recharge soon.", t.balance),
                });
            }
        }
        UserStatus::Limited => {
            if t.prev_status != UserStatus::Limited {
                actions.push(Action::Notify {
                    username: user.to_string(),
                    message: format!(
                        "Balance nearly exhausted ({:.4}); account limited.",
                        t.balance
                    ),
                });
                if let Some(cpu) = t.cpu_control {
                    actions.push(Action::SetCpuQuota {
                        username: user.to_string(),
                        cpu_quota_percent: cpu.limited_percent,
                        reason: "low balance, CPU use limited".to_string(),
                    });
                }
            }
        }
        UserStatus::Blocked => {
            if t.prev_status != UserStatus::Blocked {
                actions.push(Action::BlockUser {
                    username: user.to_string(),
                    reason: "balance exhausted, new GPU tasks blocked".to_string(),
                });
                actions.push(Action::Notify {
                    username: user.to_string(),
                    message: format!(
                        "Balance exhausted ({:.4}); account blocked. Running tasks will be \
                         terminated after the grace period.",
                        t.balance
                    ),
                });
                if let Some(cpu) = t.cpu_control {
                    actions.push(Action::SetCpuQuota {
                        username: user.to_string(),
                        cpu_quota_percent: cpu.blocked_percent,
                        reason: "balance exhausted, CPU use restricted".to_string(),
                    });
                }
            }

            // Kill fires `grace_seconds` after entering blocked, checked on
            // every report while the user stays blocked.
            let blocked_since = t.blocked_at.unwrap_or(t.now);
            if t.now - blocked_since >= t.grace_seconds && !t.pids.is_empty() {
                actions.push(Action::KillProcess {
                    username: user.to_string(),
                    pids: t.pids.to_vec(),
                    reason: "balance exhausted past grace period".to_string(),
                });
            }
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(prev: UserStatus, new: UserStatus) -> Transition<'static> {
        Transition {
            now: 1000,
            prev_status: prev,
            new_status: new,
            balance: 0.0,
            blocked_at: None,
            local_username: "alice",
            pids: &[],
            grace_seconds: 30,
            cpu_control: None,
        }
    }

    fn kinds(actions: &[Action]) -> Vec<&'static str> {
        actions.iter().map(Action::kind).collect()
    }

    #[test]
    fn recovery_emits_unblock() {
        let got = decide_actions(&transition(UserStatus::Blocked, UserStatus::Normal));
        assert_eq!(kinds(&got), ["unblock_user"]);
    }

    #[test]
    fn recovery_restores_cpu_quota_when_enabled() {
        let t = Transition {
            cpu_control: Some(CpuControl { limited_percent: 50, blocked_percent: 10 }),
            ..transition(UserStatus::Limited, UserStatus::Normal)
        };
        let got = decide_actions(&t);
        assert_eq!(kinds(&got), ["unblock_user", "set_cpu_quota"]);
        assert!(matches!(
            got[1],
            Action::SetCpuQuota { cpu_quota_percent: 0, .. }
        ));
    }

    #[test]
    fn warning_notifies_once_per_transition() {
        let got = decide_actions(&transition(UserStatus::Normal, UserStatus::Warning));
        assert_eq!(kinds(&got), ["notify"]);
        let repeat = decide_actions(&transition(UserStatus::Warning, UserStatus::Warning));
        assert!(repeat.is_empty());
    }

    #[test]
    fn limited_applies_quota_when_enabled() {
        let t = Transition {
            cpu_control: Some(CpuControl { limited_percent: 50, blocked_percent: 10 }),
            ..transition(UserStatus::Warning, UserStatus::Limited)
        };
        let got = decide_actions(&t);
        assert_eq!(kinds(&got), ["notify", "set_cpu_quota"]);
        assert!(matches!(
            got[1],
            Action::SetCpuQuota { cpu_quota_percent: 50, .. }
        ));
    }

    #[test]
    fn fresh_block_within_grace_holds_the_kill() {
        let t = Transition {
            blocked_at: Some(1000),
            pids: &[999],
            ..transition(UserStatus::Warning, UserStatus::Blocked)
        };
        let got = decide_actions(&t);
        assert_eq!(kinds(&got), ["block_user", "notify"]);
    }

    #[test]
    fn repeat_block_past_grace_kills_without_renotifying() {
        let t = Transition {
            blocked_at: Some(969),
            pids: &[999],
            ..transition(UserStatus::Blocked, UserStatus::Blocked)
        };
        let got = decide_actions(&t);
        assert_eq!(kinds(&got), ["kill_process"]);
        assert!(matches!(&got[0], Action::KillProcess { pids, .. } if pids == &vec![999]));
    }

    #[test]
    fn kill_needs_pids() {
        let t = Transition {
            blocked_at: Some(0),
            ..transition(UserStatus::Blocked, UserStatus::Blocked)
        };
        assert!(decide_actions(&t).is_empty());
    }

    #[test]
    fn zero_grace_kills_on_first_block() {
        let t = Transition {
            blocked_at: Some(1000),
            pids: &[7],
            grace_seconds: 0,
            ..transition(UserStatus::Normal, UserStatus::Blocked)
        };
        let got = decide_actions(&t);
        assert_eq!(kinds(&got), ["block_user", "notify", "kill_process"]);
    }
}
