//! Tunnel mesh daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use tunnelmesh::feed::KubeFeed;
use tunnelmesh::host::{IpRouteHost, NetworkHost};
use tunnelmesh::{Agent, Config, NodeStore, Reconciler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Config::load()?;
    info!("Starting tunnelmesh with config: {:?}", cfg);

    let local = cfg.local_context()?;
    info!(
        "Node [{}] has ip [{}] and gateway ips {:?}",
        local.node_name, local.node_ip, local.gateways
    );

    let host: Arc<dyn NetworkHost> = Arc::new(IpRouteHost::new(cfg.ip_binary.clone()));
    let feed = KubeFeed::connect().await?;
    let store = Arc::new(NodeStore::new());
    let agent = Agent::new(feed, store, Reconciler::new(host, local));

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = &result {
                error!("Membership feed failed: {}", e);
            }
            result?;
        }
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    info!("Shutdown complete.");
    Ok(())
}
