use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use ipnet::IpNet;
use log::{debug, error, info, warn};

use super::Reconciler;
use crate::host::{Link, TunnelSpec};
use crate::types::{Nodes, PeerNode, TUNNEL_KIND, TUNNEL_PREFIX};

impl Reconciler {
    /// Converges the managed tunnel interfaces to one per peer.
    ///
    /// Managed interfaces nobody wants are removed, broken ones are rebuilt
    /// and missing ones are created with the local gateways bound to them.
    pub async fn apply_tunnels(&self, nodes: &Nodes) {
        info!("Applying tunnels");
        let desired: BTreeMap<&str, &PeerNode> = nodes
            .values()
            .map(|peer| (peer.tunnel.as_str(), peer))
            .collect();

        let links = match self.host.list_links().await {
            Ok(links) => links,
            Err(e) => {
                error!("Cannot list links: {}", e);
                return;
            }
        };

        let mut existing: HashMap<String, Link> = HashMap::new();
        for link in links.into_iter().filter(is_managed) {
            if desired.contains_key(link.name.as_str()) {
                existing.insert(link.name.clone(), link);
                continue;
            }
            info!("Removing unknown tunnel [{}]", link.name);
            if let Err(e) = self.host.delete_link(&link.name).await {
                error!("Cannot delete tunnel [{}]: {}", link.name, e);
            }
        }

        for (&name, &peer) in &desired {
            if let Some(link) = existing.get(name) {
                if self.is_tunnel_good(link, peer).await {
                    debug!("Tunnel [{}] to node [{}] is good, skipping", name, peer.name);
                    continue;
                }
                info!("Tunnel [{}] to node [{}] is not good, recreating", name, peer.name);
                if let Err(e) = self.host.delete_link(name).await {
                    error!(
                        "Cannot delete stale tunnel [{}] to node [{}]: {}",
                        name, peer.name, e
                    );
                    continue;
                }
            }
            self.create_tunnel(name, peer).await;
        }
    }

    async fn create_tunnel(&self, name: &str, peer: &PeerNode) {
        info!("Creating tunnel [{}] to node [{}] ({})", name, peer.name, peer.ip);
        let spec = TunnelSpec {
            name: name.to_string(),
            local: self.local.node_ip,
            remote: peer.ip,
        };
        if let Err(e) = self.host.create_tunnel(&spec).await {
            error!("Cannot create tunnel [{}]: {}", name, e);
            return;
        }
        for gateway in &self.local.gateways {
            if let Err(e) = self.host.add_address(name, IpNet::from(*gateway)).await {
                warn!("Cannot add address [{}] to tunnel [{}]: {}", gateway, name, e);
            }
        }
        if let Err(e) = self.host.set_up(name).await {
            error!("Cannot bring tunnel [{}] up: {}", name, e);
        }
    }

    async fn is_tunnel_good(&self, link: &Link, peer: &PeerNode) -> bool {
        if !link.up {
            return false;
        }
        if !same_ip(link.local, self.local.node_ip) || !same_ip(link.remote, peer.ip) {
            return false;
        }
        let addresses = match self.host.list_addresses(&link.name).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("Cannot list addresses of tunnel [{}]: {}", link.name, e);
                return false;
            }
        };
        let bound: BTreeSet<String> = addresses
            .iter()
            .filter(|a| a.is_global())
            .map(|a| a.address.addr().to_string())
            .collect();
        bound == self.local.gateway_keys()
    }
}

fn is_managed(link: &Link) -> bool {
    link.kind.as_deref() == Some(TUNNEL_KIND) && link.name.starts_with(TUNNEL_PREFIX)
}

fn same_ip(actual: Option<IpAddr>, expected: IpAddr) -> bool {
    actual.map(|ip| ip.to_canonical()) == Some(expected.to_canonical())
}
