//! Kernel network management.
//!
//! `NetworkHost` is the seam between the reconcilers and the kernel.
//! `IpRouteHost` drives iproute2; `MemoryHost` keeps everything in memory
//! and is what the tests run against.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::HostError;

pub mod iproute;
pub mod memory;

pub use iproute::IpRouteHost;
pub use memory::MemoryHost;

/// A network interface as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    /// Link kind, e.g. `ipip`. `None` for plain devices.
    pub kind: Option<String>,
    /// Administrative state.
    pub up: bool,
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
}

/// Parameters of a new point-to-point tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub local: IpAddr,
    pub remote: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Global,
    Site,
    Link,
    Host,
}

impl AddressScope {
    /// Parses iproute2's scope names; numeric and unknown scopes map to `None`.
    pub fn parse(scope: &str) -> Option<Self> {
        match scope {
            "global" | "universe" => Some(AddressScope::Global),
            "site" => Some(AddressScope::Site),
            "link" => Some(AddressScope::Link),
            "host" => Some(AddressScope::Host),
            _ => None,
        }
    }
}

/// An address bound to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address: IpNet,
    pub scope: Option<AddressScope>,
}

impl Address {
    pub fn is_global(&self) -> bool {
        self.scope == Some(AddressScope::Global)
    }
}

/// A route scoped to one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
}

impl Route {
    /// A destination-only route: no preferred source, no next hop.
    pub fn direct(destination: IpNet) -> Self {
        Self {
            destination,
            source: None,
            gateway: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.source.is_none() && self.gateway.is_none()
    }
}

/// Individual kernel operations, used to name failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    ListLinks,
    CreateTunnel,
    DeleteLink,
    SetUp,
    ListAddresses,
    AddAddress,
    ListRoutes,
    AddRoute,
    DeleteRoute,
}

#[async_trait]
pub trait NetworkHost: Send + Sync {
    /// All interfaces on the host.
    async fn list_links(&self) -> Result<Vec<Link>, HostError>;

    /// Looks up one interface; `Ok(None)` when it does not exist.
    async fn link(&self, name: &str) -> Result<Option<Link>, HostError> {
        Ok(self
            .list_links()
            .await?
            .into_iter()
            .find(|link| link.name == name))
    }

    async fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), HostError>;

    async fn delete_link(&self, name: &str) -> Result<(), HostError>;

    async fn set_up(&self, name: &str) -> Result<(), HostError>;

    async fn list_addresses(&self, name: &str) -> Result<Vec<Address>, HostError>;

    async fn add_address(&self, name: &str, address: IpNet) -> Result<(), HostError>;

    /// Routes of both address families on the interface.
    async fn list_routes(&self, name: &str) -> Result<Vec<Route>, HostError>;

    async fn add_route(&self, name: &str, route: &Route) -> Result<(), HostError>;

    async fn delete_route(&self, name: &str, route: &Route) -> Result<(), HostError>;
}
