//! In-memory implementation of `NetworkHost`.
//!
//! This is primarily for testing. It follows kernel semantics closely enough
//! for the reconcilers: duplicate names and routes are rejected, deleting an
//! interface drops its addresses and routes, and every mutating call is
//! counted so tests can assert that a converged host is left alone.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ipnet::IpNet;

use super::{Address, AddressScope, HostOp, Link, NetworkHost, Route, TunnelSpec};
use crate::error::HostError;
use crate::types::TUNNEL_KIND;

#[derive(Debug, Default)]
pub struct MemoryHost {
    inner: Mutex<MemoryHostInner>,
}

#[derive(Debug, Default)]
struct MemoryHostInner {
    links: BTreeMap<String, MemoryLink>,
    failing: HashSet<HostOp>,
    mutations: usize,
}

#[derive(Debug, Clone)]
struct MemoryLink {
    link: Link,
    addresses: Vec<Address>,
    routes: Vec<Route>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an interface without counting it as a mutation.
    pub fn insert_link(&self, link: Link) {
        let mut inner = self.state();
        inner.links.insert(
            link.name.clone(),
            MemoryLink {
                link,
                addresses: Vec::new(),
                routes: Vec::new(),
            },
        );
    }

    /// Seeds an address on an existing interface.
    pub fn insert_address(&self, name: &str, address: Address) {
        let mut inner = self.state();
        if let Some(entry) = inner.links.get_mut(name) {
            entry.addresses.push(address);
        }
    }

    /// Seeds a route on an existing interface.
    pub fn insert_route(&self, name: &str, route: Route) {
        let mut inner = self.state();
        if let Some(entry) = inner.links.get_mut(name) {
            entry.routes.push(route);
        }
    }

    /// Makes every call of `op` fail until [`MemoryHost::heal`].
    pub fn fail(&self, op: HostOp) {
        self.state().failing.insert(op);
    }

    pub fn heal(&self) {
        self.state().failing.clear();
    }

    /// Number of successful mutating calls so far.
    pub fn mutations(&self) -> usize {
        self.state().mutations
    }

    pub fn links(&self) -> Vec<Link> {
        let inner = self.state();
        inner.links.values().map(|e| e.link.clone()).collect()
    }

    /// Names of interfaces starting with `prefix`, sorted.
    pub fn link_names(&self, prefix: &str) -> Vec<String> {
        let inner = self.state();
        inner
            .links
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn addresses(&self, name: &str) -> Vec<Address> {
        let inner = self.state();
        inner
            .links
            .get(name)
            .map(|e| e.addresses.clone())
            .unwrap_or_default()
    }

    pub fn routes(&self, name: &str) -> Vec<Route> {
        let inner = self.state();
        inner
            .links
            .get(name)
            .map(|e| e.routes.clone())
            .unwrap_or_default()
    }

    /// A panic while the lock was held leaves the state usable; the next
    /// caller picks it up as is.
    fn state(&self) -> MutexGuard<'_, MemoryHostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<T>(
        &self,
        op: HostOp,
        f: impl FnOnce(&mut MemoryHostInner) -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        let mut inner = self.state();
        if inner.failing.contains(&op) {
            return Err(HostError::Injected(op));
        }
        f(&mut inner)
    }

    fn mutate(
        &self,
        op: HostOp,
        f: impl FnOnce(&mut MemoryHostInner) -> Result<(), HostError>,
    ) -> Result<(), HostError> {
        self.with(op, |inner| {
            f(inner)?;
            inner.mutations += 1;
            Ok(())
        })
    }
}

impl MemoryHostInner {
    fn entry(&mut self, name: &str) -> Result<&mut MemoryLink, HostError> {
        self.links
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))
    }
}

fn scope_of(ip: IpAddr) -> AddressScope {
    match ip {
        IpAddr::V6(v6) if v6.segments()[0] & 0xffc0 == 0xfe80 => AddressScope::Link,
        ip if ip.is_loopback() => AddressScope::Host,
        _ => AddressScope::Global,
    }
}

#[async_trait]
impl NetworkHost for MemoryHost {
    async fn list_links(&self) -> Result<Vec<Link>, HostError> {
        self.with(HostOp::ListLinks, |inner| {
            Ok(inner.links.values().map(|e| e.link.clone()).collect())
        })
    }

    async fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), HostError> {
        self.mutate(HostOp::CreateTunnel, |inner| {
            if inner.links.contains_key(&spec.name) {
                return Err(HostError::AlreadyExists(spec.name.clone()));
            }
            let link = Link {
                name: spec.name.clone(),
                kind: Some(TUNNEL_KIND.to_string()),
                up: false,
                local: Some(spec.local),
                remote: Some(spec.remote),
            };
            inner.links.insert(
                spec.name.clone(),
                MemoryLink {
                    link,
                    addresses: Vec::new(),
                    routes: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn delete_link(&self, name: &str) -> Result<(), HostError> {
        self.mutate(HostOp::DeleteLink, |inner| {
            inner
                .links
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| HostError::NotFound(name.to_string()))
        })
    }

    async fn set_up(&self, name: &str) -> Result<(), HostError> {
        self.mutate(HostOp::SetUp, |inner| {
            inner.entry(name)?.link.up = true;
            Ok(())
        })
    }

    async fn list_addresses(&self, name: &str) -> Result<Vec<Address>, HostError> {
        self.with(HostOp::ListAddresses, |inner| {
            Ok(inner.entry(name)?.addresses.clone())
        })
    }

    async fn add_address(&self, name: &str, address: IpNet) -> Result<(), HostError> {
        self.mutate(HostOp::AddAddress, |inner| {
            let entry = inner.entry(name)?;
            if entry.addresses.iter().any(|a| a.address == address) {
                return Err(HostError::AlreadyExists(address.to_string()));
            }
            entry.addresses.push(Address {
                address,
                scope: Some(scope_of(address.addr())),
            });
            Ok(())
        })
    }

    async fn list_routes(&self, name: &str) -> Result<Vec<Route>, HostError> {
        self.with(HostOp::ListRoutes, |inner| Ok(inner.entry(name)?.routes.clone()))
    }

    async fn add_route(&self, name: &str, route: &Route) -> Result<(), HostError> {
        self.mutate(HostOp::AddRoute, |inner| {
            let entry = inner.entry(name)?;
            if entry.routes.contains(route) {
                return Err(HostError::AlreadyExists(route.destination.to_string()));
            }
            entry.routes.push(route.clone());
            Ok(())
        })
    }

    async fn delete_route(&self, name: &str, route: &Route) -> Result<(), HostError> {
        self.mutate(HostOp::DeleteRoute, |inner| {
            let entry = inner.entry(name)?;
            let position = entry
                .routes
                .iter()
                .position(|r| r == route)
                .ok_or_else(|| HostError::NotFound(route.destination.to_string()))?;
            entry.routes.remove(position);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> TunnelSpec {
        TunnelSpec {
            name: name.into(),
            local: "10.0.0.1".parse().unwrap(),
            remote: "10.0.0.5".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn duplicate_tunnel_is_rejected() {
        let host = MemoryHost::new();
        host.create_tunnel(&spec("cni.1")).await.unwrap();
        let err = host.create_tunnel(&spec("cni.1")).await.unwrap_err();
        assert!(matches!(err, HostError::AlreadyExists(_)));
        assert_eq!(host.mutations(), 1);
    }

    #[tokio::test]
    async fn deleting_a_link_drops_its_routes() {
        let host = MemoryHost::new();
        host.create_tunnel(&spec("cni.1")).await.unwrap();
        host.add_route("cni.1", &Route::direct("10.1.0.0/24".parse().unwrap()))
            .await
            .unwrap();
        host.delete_link("cni.1").await.unwrap();
        assert!(host.routes("cni.1").is_empty());
        assert!(host.link("cni.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_do_not_count() {
        let host = MemoryHost::new();
        host.fail(HostOp::CreateTunnel);
        assert!(host.create_tunnel(&spec("cni.1")).await.is_err());
        assert_eq!(host.mutations(), 0);
        host.heal();
        host.create_tunnel(&spec("cni.1")).await.unwrap();
        assert_eq!(host.mutations(), 1);
    }

    #[tokio::test]
    async fn keeps_working_after_a_panic_under_the_lock() {
        let host = MemoryHost::new();
        host.create_tunnel(&spec("cni.1")).await.unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = host.inner.lock().unwrap();
            panic!("poison the lock");
        }));
        assert!(result.is_err());
        assert!(host.inner.is_poisoned());

        host.create_tunnel(&spec("cni.2")).await.unwrap();
        assert_eq!(host.link_names("cni."), vec!["cni.1", "cni.2"]);
        assert_eq!(host.mutations(), 2);
    }

    #[tokio::test]
    async fn added_addresses_get_a_scope() {
        let host = MemoryHost::new();
        host.create_tunnel(&spec("cni.1")).await.unwrap();
        host.add_address("cni.1", "10.244.0.1/32".parse().unwrap())
            .await
            .unwrap();
        host.add_address("cni.1", "fe80::1/64".parse().unwrap())
            .await
            .unwrap();
        let addresses = host.list_addresses("cni.1").await.unwrap();
        assert!(addresses[0].is_global());
        assert_eq!(addresses[1].scope, Some(AddressScope::Link));
    }
}
