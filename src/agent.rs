//! Change feed consumer.
//!
//! The agent is the only writer of the [`NodeStore`]. Events are handled one
//! at a time: each accepted change is written to the store and followed by a
//! full reconciliation pass before the next event is read.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::diff::has_updates;
use crate::error::FeedError;
use crate::feed::{FeedMessage, MembershipFeed, NodeEvent, NodeObject};
use crate::reconcile::Reconciler;
use crate::store::NodeStore;
use crate::types::{mint_free_tunnel_id, Nodes, PeerNode};

pub struct Agent<F> {
    feed: F,
    store: Arc<NodeStore>,
    reconciler: Reconciler,
}

impl<F: MembershipFeed> Agent<F> {
    pub fn new(feed: F, store: Arc<NodeStore>, reconciler: Reconciler) -> Self {
        Self {
            feed,
            store,
            reconciler,
        }
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    fn local_name(&self) -> &str {
        &self.reconciler.local().node_name
    }

    /// Consumes the membership feed forever.
    ///
    /// A closed subscription is replaced immediately. Only a failure to
    /// establish a subscription ends the loop.
    pub async fn run(&self) -> Result<(), FeedError> {
        loop {
            let mut events = self.feed.subscribe().await?;
            info!("Start listening to membership events");
            while let Some(message) = events.recv().await {
                self.handle(message).await;
            }
            warn!("Membership subscription closed, resubscribing");
        }
    }

    /// Handles one message. Returns whether a reconciliation pass ran.
    pub async fn handle(&self, message: FeedMessage) -> bool {
        let event = match NodeEvent::decode(message) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping membership event: {}", e);
                return false;
            }
        };
        if event.node_name() == Some(self.local_name()) {
            debug!("Ignoring event for the local node");
            return false;
        }

        let changed = match &event {
            NodeEvent::Added(node) => {
                info!("Adding a node [{}]", node.name());
                self.upsert_node(node).await
            }
            NodeEvent::Modified(node) => {
                info!("Modifying a node [{}]", node.name());
                self.upsert_node(node).await
            }
            NodeEvent::Deleted(node) => self.delete_node(node).await,
            NodeEvent::Resync { nodes, undecodable } => {
                self.resync(nodes, undecodable).await;
                true
            }
        };
        if changed {
            self.update().await;
        }
        changed
    }

    async fn update(&self) {
        let nodes = self.store.snapshot().await;
        self.reconciler.pass(&nodes).await;
    }

    async fn upsert_node(&self, node: &NodeObject) -> bool {
        let mut nodes = self.store.snapshot().await;
        if !merge_node(&mut nodes, node) {
            return false;
        }
        self.store.replace(nodes).await;
        true
    }

    async fn delete_node(&self, node: &NodeObject) -> bool {
        info!("Deleting a node [{}]", node.name());
        let mut nodes = self.store.snapshot().await;
        if nodes.remove(node.name()).is_none() {
            debug!("Deleting node [{}] which is not present", node.name());
            return false;
        }
        self.store.replace(nodes).await;
        info!("Deleted node [{}]", node.name());
        true
    }

    /// Rebuilds the store from a complete listing: absent peers are pruned,
    /// listed ones merged like add/modify events. Peers whose entry could not
    /// be decoded are listed all the same and keep their stored state.
    async fn resync(&self, listed: &[NodeObject], undecodable: &[String]) {
        info!("Resyncing {} nodes", listed.len());
        let mut nodes = self.store.snapshot().await;
        let names: HashSet<&str> = listed
            .iter()
            .map(NodeObject::name)
            .chain(undecodable.iter().map(String::as_str))
            .collect();
        nodes.retain(|name, _| {
            let keep = names.contains(name.as_str());
            if !keep {
                info!("Node [{}] is gone, removing", name);
            }
            keep
        });
        for node in listed.iter().filter(|n| n.name() != self.local_name()) {
            merge_node(&mut nodes, node);
        }
        self.store.replace(nodes).await;
    }
}

/// Writes a candidate for `node` into `nodes` if it differs materially from
/// the stored peer. A fresh tunnel name comes with every accepted candidate;
/// rejected candidates take theirs with them.
fn merge_node(nodes: &mut Nodes, node: &NodeObject) -> bool {
    let mut candidate = match PeerNode::from_object(node) {
        Ok(candidate) => candidate,
        Err(e) => {
            warn!("Dropping node [{}]: {}", node.name(), e);
            return false;
        }
    };
    let existing = nodes.get(node.name());
    if existing.is_some() && !has_updates(Some(&candidate), existing) {
        debug!("Node [{}] has no material changes", node.name());
        return false;
    }
    if nodes.values().any(|peer| peer.tunnel == candidate.tunnel) {
        candidate.tunnel = mint_free_tunnel_id(|id| nodes.values().any(|peer| peer.tunnel == id));
    }
    info!(
        "Node [{}] at {} is assigned tunnel [{}]",
        candidate.name, candidate.ip, candidate.tunnel
    );
    nodes.insert(candidate.name.clone(), candidate);
    true
}
