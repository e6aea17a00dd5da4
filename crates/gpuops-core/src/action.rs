//! Enforcement actions the controller hands to node agents.
//!
//! The JSON wire shape is `{"type": "...", ...payload}`; the agent switches
//! on `type` and must ignore nothing: an unknown action is an error, not a
//! no-op, so protocol drift is caught loudly.

use serde::{Deserialize, Serialize};

/// One enforcement action addressed to a node-local account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Append a message to the user's notice file.
    Notify { username: String, message: String },
    /// Drop the cooperative GPU-block flag file for the user.
    BlockUser { username: String, reason: String },
    /// Remove the GPU-block flag file if present.
    UnblockUser { username: String },
    /// Apply (or with 0, clear) a user-level CPU quota.
    SetCpuQuota {
        username: String,
        cpu_quota_percent: u32,
        reason: String,
    },
    /// Terminate the given pids if they still belong to the user.
    KillProcess {
        username: String,
        pids: Vec<i32>,
        reason: String,
    },
    /// Disconnect every non-exempt SSH session on the node.
    KickSshAll { reason: String },
    /// Disconnect one user's SSH sessions.
    KickSshUser { username: String, reason: String },
}

impl Action {
    /// Stable label used for metrics and log lines.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notify",
            Self::BlockUser { .. } => "block_user",
            Self::UnblockUser { .. } => "unblock_user",
            Self::SetCpuQuota { .. } => "set_cpu_quota",
            Self::KillProcess { .. } => "kill_process",
            Self::KickSshAll { .. } => "kick_ssh_all",
            Self::KickSshUser { .. } => "kick_ssh_user",
        }
    }
}

/// Response body for `POST /api/metrics` and `GET /api/node/actions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsResponse {
    pub actions: Vec<Action>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_with_type_tag() {
        let action = Action::KillProcess {
            username: "alice".into(),
            pids: vec![101, 202],
            reason: "balance exhausted".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "kill_process");
        assert_eq!(json["pids"][1], 202);

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<Action>(r#"{"type":"reboot_node"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let action = Action::KickSshAll { reason: String::new() };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], action.kind());
    }
}
