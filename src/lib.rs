//! Tunnel mesh agent.
//!
//! Keeps one IP-in-IP tunnel per cluster peer and the routes to each
//! peer's pod ranges converged with the cluster's node membership.

pub mod agent;
pub mod config;
pub mod diff;
pub mod error;
pub mod feed;
pub mod host;
pub mod reconcile;
pub mod store;
pub mod types;

pub use agent::Agent;
pub use config::Config;
pub use reconcile::Reconciler;
pub use store::NodeStore;
