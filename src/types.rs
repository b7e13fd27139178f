//! Data structures used throughout the agent.
//!
//! A [`PeerNode`] is the agent's view of another cluster member: its
//! routable address, the pod ranges behind it and the name of the tunnel
//! interface carrying traffic to it. [`LocalContext`] describes this host
//! and never changes once the agent has started.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::IpNet;

use crate::error::NodeError;
use crate::feed::NodeObject;

/// Name prefix reserved for tunnel interfaces managed by this agent.
pub const TUNNEL_PREFIX: &str = "cni.";

/// Link kind of the managed tunnel interfaces.
pub const TUNNEL_KIND: &str = "ipip";

/// Peers keyed by node name.
pub type Nodes = HashMap<String, PeerNode>;

/// A cluster member other than the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    pub name: String,
    pub ip: IpAddr,
    /// Canonical ranges, deduplicated and sorted by their text form.
    pub pod_cidrs: Vec<IpNet>,
    /// Name of the tunnel interface towards this peer.
    pub tunnel: String,
}

impl PeerNode {
    /// Builds a peer from a decoded node object, minting a fresh tunnel id.
    pub fn from_object(object: &NodeObject) -> Result<Self, NodeError> {
        let address = object.primary_address().ok_or(NodeError::MissingAddress)?;
        let ip = address
            .parse::<IpAddr>()
            .map_err(|_| NodeError::InvalidAddress(address.to_string()))?;
        let pod_cidrs = parse_cidrs(object.pod_cidr_strings())?;
        Ok(Self {
            name: object.name().to_string(),
            ip,
            pod_cidrs,
            tunnel: mint_tunnel_id(),
        })
    }
}

/// Parses address ranges into canonical networks.
///
/// Host bits are cleared, empty strings are ignored and duplicates collapse.
/// The result is ordered by the canonical text of each range.
pub fn parse_cidrs<'a, I>(cidrs: I) -> Result<Vec<IpNet>, NodeError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut parsed = BTreeMap::new();
    for cidr in cidrs {
        let cidr = cidr.trim();
        if cidr.is_empty() {
            continue;
        }
        let net = cidr
            .parse::<IpNet>()
            .map_err(|source| NodeError::InvalidCidr {
                cidr: cidr.to_string(),
                source,
            })?
            .trunc();
        parsed.insert(net.to_string(), net);
    }
    Ok(parsed.into_values().collect())
}

/// Mints a tunnel interface name from the current time.
///
/// Every accepted node change gets a new name, so the previous interface
/// is orphaned and torn down by the next pass.
pub fn mint_tunnel_id() -> String {
    tunnel_id(tunnel_seed())
}

/// Like [`mint_tunnel_id`], but steps past names for which `taken` holds.
/// Falls back to the clock's pick once every name is taken.
pub fn mint_free_tunnel_id(taken: impl Fn(&str) -> bool) -> String {
    let seed = tunnel_seed();
    (0..TUNNEL_ID_SPACE)
        .map(|step| tunnel_id(seed + step))
        .find(|id| !taken(id))
        .unwrap_or_else(|| tunnel_id(seed))
}

const TUNNEL_ID_SPACE: u128 = 100_000;

fn tunnel_seed() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

fn tunnel_id(n: u128) -> String {
    format!("{}{}", TUNNEL_PREFIX, n % TUNNEL_ID_SPACE)
}

/// First usable address of a range: the network address plus one.
/// Single-address ranges yield the address itself.
pub fn first_usable(net: &IpNet) -> IpAddr {
    match net {
        IpNet::V4(net) if net.prefix_len() < 32 => {
            IpAddr::V4(Ipv4Addr::from(u32::from(net.network()) + 1))
        }
        IpNet::V6(net) if net.prefix_len() < 128 => {
            IpAddr::V6(Ipv6Addr::from(u128::from(net.network()) + 1))
        }
        _ => net.network(),
    }
}

/// Identity and addressing of this host. Immutable after startup.
#[derive(Debug, Clone)]
pub struct LocalContext {
    pub node_name: String,
    pub node_ip: IpAddr,
    pub pod_cidrs: Vec<IpNet>,
    /// One address per local pod range, bound to every tunnel.
    pub gateways: Vec<IpAddr>,
}

impl LocalContext {
    pub fn new(node_name: impl Into<String>, node_ip: IpAddr, pod_cidrs: Vec<IpNet>) -> Self {
        let gateways = pod_cidrs.iter().map(first_usable).collect();
        Self {
            node_name: node_name.into(),
            node_ip,
            pod_cidrs,
            gateways,
        }
    }

    /// Gateway addresses in text form, for set comparison.
    pub fn gateway_keys(&self) -> BTreeSet<String> {
        self.gateways.iter().map(|ip| ip.to_string()).collect()
    }
}
