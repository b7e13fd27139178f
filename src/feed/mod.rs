//! Cluster membership feed.
//!
//! A feed hands out subscriptions: channels of raw node events whose
//! payloads are untyped JSON. [`NodeEvent::decode`] turns each message into
//! a typed event and rejects anything that does not look like a node.

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{DecodeError, FeedError};

pub mod kubernetes;
pub use kubernetes::KubeFeed;

/// Kind of change carried by a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// A message on a subscription channel.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// A single membership change.
    Event { kind: EventKind, object: Value },
    /// The complete membership as of the start of a subscription.
    Resync(Vec<Value>),
}

#[async_trait]
pub trait MembershipFeed: Send + Sync {
    /// Opens a subscription. The channel closes when the subscription ends;
    /// callers are expected to subscribe again.
    async fn subscribe(&self) -> Result<mpsc::Receiver<FeedMessage>, FeedError>;
}

/// A decoded membership message.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Added(NodeObject),
    Modified(NodeObject),
    Deleted(NodeObject),
    /// A full listing. Entries that fail to decode are left out of `nodes`;
    /// the names that could still be read from them go to `undecodable`.
    Resync {
        nodes: Vec<NodeObject>,
        undecodable: Vec<String>,
    },
}

impl NodeEvent {
    pub fn decode(message: FeedMessage) -> Result<Self, DecodeError> {
        match message {
            FeedMessage::Event { kind, object } => {
                let node: NodeObject = serde_json::from_value(object)?;
                Ok(match kind {
                    EventKind::Added => NodeEvent::Added(node),
                    EventKind::Modified => NodeEvent::Modified(node),
                    EventKind::Deleted => NodeEvent::Deleted(node),
                })
            }
            FeedMessage::Resync(objects) => {
                let mut nodes = Vec::with_capacity(objects.len());
                let mut undecodable = Vec::new();
                for object in objects {
                    let name = raw_name(&object).map(str::to_string);
                    match serde_json::from_value::<NodeObject>(object) {
                        Ok(node) => nodes.push(node),
                        Err(e) => {
                            warn!(
                                "Skipping undecodable node [{}] in resync: {}",
                                name.as_deref().unwrap_or("<unnamed>"),
                                e
                            );
                            undecodable.extend(name);
                        }
                    }
                }
                Ok(NodeEvent::Resync { nodes, undecodable })
            }
        }
    }

    /// Name of the node a single-node event refers to.
    pub fn node_name(&self) -> Option<&str> {
        match self {
            NodeEvent::Added(n) | NodeEvent::Modified(n) | NodeEvent::Deleted(n) => Some(n.name()),
            NodeEvent::Resync { .. } => None,
        }
    }
}

fn raw_name(object: &Value) -> Option<&str> {
    object.pointer("/metadata/name").and_then(Value::as_str)
}

/// The subset of a cluster Node object the agent reads.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeObject {
    metadata: NodeMeta,
    #[serde(default)]
    spec: NodeSpec,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeMeta {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NodeSpec {
    #[serde(rename = "podCIDR", default)]
    pod_cidr: Option<String>,
    #[serde(rename = "podCIDRs", default)]
    pod_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeAddress {
    address: String,
}

impl NodeObject {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The first listed address, taken as the node's IP.
    pub fn primary_address(&self) -> Option<&str> {
        self.status.addresses.first().map(|a| a.address.as_str())
    }

    /// The primary range field followed by the range list, unparsed.
    pub fn pod_cidr_strings(&self) -> impl Iterator<Item = &str> {
        self.spec
            .pod_cidr
            .as_deref()
            .into_iter()
            .chain(self.spec.pod_cidrs.iter().map(String::as_str))
    }
}
