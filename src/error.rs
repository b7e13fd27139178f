//! Error types shared across the agent.

use std::io;

use thiserror::Error;

/// Failures of a single kernel network operation.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("cannot parse output of `{command}`: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("interface {0} does not exist")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("operation {0:?} rejected")]
    Injected(crate::host::HostOp),
}

/// Failures to establish or keep a membership subscription.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("membership feed unavailable: {0}")]
    Unavailable(String),
}

/// A feed payload that could not be decoded as a node.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a node object: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A decoded node whose addressing cannot be used.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node has no address")]
    MissingAddress,

    #[error("invalid node address [{0}]")]
    InvalidAddress(String),

    #[error("cannot parse cidr [{cidr}]: {source}")]
    InvalidCidr {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}
