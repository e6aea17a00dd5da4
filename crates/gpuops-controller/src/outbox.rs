//! Per-node queue of operator-initiated actions.
//!
//! Actions land here from the admin side (SSH-list changes, disconnect-all)
//! and are delivered on the node's next contact: appended to `/api/metrics`
//! responses and returned by the `/api/node/actions` poll. The queue is not
//! persisted — operator kicks are retried by the operator, and billing
//! actions are regenerated from state on the next report.

use std::collections::HashMap;
use std::sync::Mutex;

use gpuops_core::Action;

#[derive(Debug, Default)]
pub struct ActionOutbox {
    queues: Mutex<HashMap<String, Vec<Action>>>,
}

impl ActionOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one action for a node. Empty node ids are dropped.
    pub fn enqueue(&self, node_id: &str, action: Action) {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return;
        }
        let mut queues = self.queues.lock().expect("outbox lock poisoned");
        queues.entry(node_id.to_string()).or_default().push(action);
    }

    /// Remove and return everything queued for a node.
    pub fn drain(&self, node_id: &str) -> Vec<Action> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Vec::new();
        }
        let mut queues = self.queues.lock().expect("outbox lock poisoned");
        queues.remove(node_id).unwrap_or_default()
    }

    /// Total queued actions across all nodes (metrics only).
    pub fn pending_total(&self) -> usize {
        let queues = self.queues.lock().expect("outbox lock poisoned");
        queues.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kick(user: &str) -> Action {
        Action::KickSshUser { username: user.into(), reason: "test".into() }
    }

    #[test]
    fn drain_is_destructive_and_ordered() {
        let outbox = ActionOutbox::new();
        outbox.enqueue("n1", kick("a"));
        outbox.enqueue("n1", kick("b"));
        outbox.enqueue("n2", kick("c"));

        let drained = outbox.drain("n1");
        assert_eq!(drained, vec![kick("a"), kick("b")]);
        assert!(outbox.drain("n1").is_empty());
        assert_eq!(outbox.pending_total(), 1);
    }

    #[test]
    fn empty_node_id_is_ignored() {
        let outbox = ActionOutbox::new();
        outbox.enqueue("  ", kick("a"));
        assert_eq!(outbox.pending_total(), 0);
        assert!(outbox.drain("").is_empty());
    }
}
