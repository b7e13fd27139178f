use std::collections::BTreeMap;

use ipnet::IpNet;
use log::{debug, error, info, warn};

use super::Reconciler;
use crate::host::Route;
use crate::types::{Nodes, PeerNode};

impl Reconciler {
    /// Converges the routes on every existing tunnel to its peer's pod ranges.
    pub async fn apply_routes(&self, nodes: &Nodes) {
        info!("Applying routes");
        let mut peers: Vec<&PeerNode> = nodes.values().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        for peer in peers {
            self.apply_peer_routes(peer).await;
        }
    }

    async fn apply_peer_routes(&self, peer: &PeerNode) {
        let tunnel = peer.tunnel.as_str();
        match self.host.link(tunnel).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("Tunnel [{}] to node [{}] does not exist, skipping routes", tunnel, peer.name);
                return;
            }
            Err(e) => {
                error!("Cannot get tunnel [{}] to node [{}]: {}", tunnel, peer.name, e);
                return;
            }
        }

        debug!("Checking routes of tunnel [{}] to node [{}]", tunnel, peer.name);
        let mut wanted: BTreeMap<String, IpNet> = peer
            .pod_cidrs
            .iter()
            .map(|cidr| (cidr.to_string(), *cidr))
            .collect();

        let routes = match self.host.list_routes(tunnel).await {
            Ok(routes) => routes,
            Err(e) => {
                error!("Cannot list routes of tunnel [{}] to node [{}]: {}", tunnel, peer.name, e);
                return;
            }
        };

        for route in routes {
            if route.is_direct() && wanted.remove(&route.destination.to_string()).is_some() {
                debug!("Route to [{}] via tunnel [{}] exists", route.destination, tunnel);
                continue;
            }
            info!("Deleting unexpected route on tunnel [{}]: {:?}", tunnel, route);
            if let Err(e) = self.host.delete_route(tunnel, &route).await {
                error!("Cannot delete route on tunnel [{}]: {}", tunnel, e);
            }
        }

        for destination in wanted.into_values() {
            info!(
                "Adding route to [{}] on node [{}] via tunnel [{}]",
                destination, peer.name, tunnel
            );
            if let Err(e) = self.host.add_route(tunnel, &Route::direct(destination)).await {
                error!(
                    "Cannot add route to [{}] via tunnel [{}]: {}",
                    destination, tunnel, e
                );
            }
        }
    }
}
