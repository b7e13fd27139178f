//! Shared holder of the known peers.

use tokio::sync::Mutex;

use crate::types::Nodes;

/// Process-wide peer map.
///
/// Readers get an owned copy; writers swap the whole map. The lock is held
/// only for the copy or the swap, never while the kernel is being touched.
#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: Mutex<Nodes>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current peers.
    pub async fn snapshot(&self) -> Nodes {
        self.nodes.lock().await.clone()
    }

    /// Atomically replaces the peer map.
    pub async fn replace(&self, nodes: Nodes) {
        *self.nodes.lock().await = nodes;
    }
}
