//! Per-node session registry
//!
//! The worker tracks which node is currently running a forked task so
//! an out-of-band kill (job aborted, node reclaimed) can terminate the
//! right process tree. The registry is plain shared state handed to
//! whoever needs it; there are no globals.

use crate::executor::process::ProcessHandle;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Node name -> active forked-process handle
#[derive(Debug, Default)]
pub struct NodeSessionRegistry {
    sessions: Mutex<HashMap<String, ProcessHandle>>,
}

impl NodeSessionRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the active process for a node, replacing any stale
    /// entry
    pub fn register(&self, node: impl Into<String>, handle: ProcessHandle) {
        let node = node.into();
        let previous = self.sessions.lock().insert(node.clone(), handle);
        if let Some(stale) = previous {
            if !stale.is_terminated() {
                tracing::warn!(%node, pid = stale.pid(), "Replacing live session entry");
            }
        }
    }

    /// Removes a node's entry without touching the process (normal
    /// completion path)
    pub fn clear(&self, node: &str) {
        self.sessions.lock().remove(node);
    }

    /// Kills the node's process tree, if one is registered
    ///
    /// Safe to race with normal completion: the handle's own
    /// idempotence makes the second terminator a no-op.
    pub fn kill(&self, node: &str) {
        let handle = self.sessions.lock().remove(node);
        match handle {
            Some(handle) => handle.terminate(),
            None => tracing::debug!(node, "Kill requested for node with no active session"),
        }
    }

    /// The active process handle for a node, if any
    #[must_use]
    pub fn get(&self, node: &str) -> Option<ProcessHandle> {
        self.sessions.lock().get(node).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(pid: u32, cookie: &str) -> ProcessHandle {
        ProcessHandle::new(pid, cookie, Duration::from_millis(100))
    }

    #[test]
    fn test_register_and_clear() {
        let registry = NodeSessionRegistry::new();
        registry.register("node-1", handle(4_000_001, "c1"));
        assert!(registry.get("node-1").is_some());

        registry.clear("node-1");
        assert!(registry.get("node-1").is_none());
    }

    #[test]
    fn test_kill_terminates_registered_handle() {
        let registry = NodeSessionRegistry::new();
        let session = handle(4_000_002, "c2");
        // Pre-terminate so the test never signals a real pid.
        session.mark_terminated();
        registry.register("node-1", session.clone());

        registry.kill("node-1");
        assert!(session.is_terminated());
        assert!(registry.get("node-1").is_none());
    }

    #[test]
    fn test_kill_unknown_node_is_a_no_op() {
        let registry = NodeSessionRegistry::new();
        registry.kill("nobody");
    }

    #[test]
    fn test_register_replaces_stale_entry() {
        let registry = NodeSessionRegistry::new();
        let stale = handle(4_000_003, "c3");
        stale.mark_terminated();
        registry.register("node-1", stale);

        let fresh = handle(4_000_004, "c4");
        registry.register("node-1", fresh.clone());
        assert_eq!(registry.get("node-1").unwrap().pid(), fresh.pid());
    }
}
