//! Convergence of kernel state with the known peers.
//!
//! A pass first converges the tunnel interfaces, then the routes on them.
//! Failures of individual kernel operations are logged and the affected
//! entity is skipped; the next pass tries again.

use std::sync::Arc;

use crate::host::NetworkHost;
use crate::types::{LocalContext, Nodes};

mod route;
mod tunnel;

pub struct Reconciler {
    host: Arc<dyn NetworkHost>,
    local: LocalContext,
}

impl Reconciler {
    pub fn new(host: Arc<dyn NetworkHost>, local: LocalContext) -> Self {
        Self { host, local }
    }

    pub fn local(&self) -> &LocalContext {
        &self.local
    }

    /// Runs the tunnel reconciler and then the route reconciler.
    pub async fn pass(&self, nodes: &Nodes) {
        self.apply_tunnels(nodes).await;
        self.apply_routes(nodes).await;
    }
}
