//! iproute2 backend.
//!
//! Every operation is one `ip` invocation. Queries use `-json` output,
//! which is decoded with serde.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use super::{Address, AddressScope, Link, NetworkHost, Route, TunnelSpec};
use crate::error::HostError;
use crate::types::TUNNEL_KIND;

/// Drives the kernel through the `ip` binary.
#[derive(Debug, Clone)]
pub struct IpRouteHost {
    binary: String,
}

impl IpRouteHost {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, HostError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!("Running `{}`", command);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| HostError::Spawn {
                command: command.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(HostError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn query<T: DeserializeOwned>(&self, args: &[&str]) -> Result<Vec<T>, HostError> {
        let stdout = self.run(args).await?;
        decode(&stdout).map_err(|source| HostError::Parse {
            command: format!("{} {}", self.binary, args.join(" ")),
            source,
        })
    }
}

#[async_trait]
impl NetworkHost for IpRouteHost {
    async fn list_links(&self) -> Result<Vec<Link>, HostError> {
        let links: Vec<RawLink> = self.query(&["-details", "-json", "link", "show"]).await?;
        Ok(links.into_iter().map(RawLink::into_link).collect())
    }

    async fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), HostError> {
        let local = spec.local.to_string();
        let remote = spec.remote.to_string();
        self.run(&[
            "link", "add", "name", &spec.name, "type", TUNNEL_KIND, "local", &local, "remote",
            &remote,
        ])
        .await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), HostError> {
        self.run(&["link", "del", "dev", name]).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<(), HostError> {
        self.run(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn list_addresses(&self, name: &str) -> Result<Vec<Address>, HostError> {
        let ifaces: Vec<RawAddrIface> = self.query(&["-json", "addr", "show", "dev", name]).await?;
        Ok(ifaces
            .into_iter()
            .flat_map(|iface| iface.addr_info)
            .filter_map(RawAddrInfo::into_address)
            .collect())
    }

    async fn add_address(&self, name: &str, address: IpNet) -> Result<(), HostError> {
        let address = address.to_string();
        self.run(&["addr", "add", &address, "dev", name]).await?;
        Ok(())
    }

    async fn list_routes(&self, name: &str) -> Result<Vec<Route>, HostError> {
        let mut routes = Vec::new();
        for (flag, default) in [("-4", "0.0.0.0/0"), ("-6", "::/0")] {
            let raw: Vec<RawRoute> = self
                .query(&["-json", flag, "route", "show", "dev", name])
                .await?;
            routes.extend(raw.into_iter().filter_map(|r| r.into_route(default)));
        }
        Ok(routes)
    }

    async fn add_route(&self, name: &str, route: &Route) -> Result<(), HostError> {
        let args = route_args(route);
        let mut command = vec!["route", "add"];
        command.extend(args.iter().map(String::as_str));
        command.extend(["dev", name]);
        self.run(&command).await?;
        Ok(())
    }

    async fn delete_route(&self, name: &str, route: &Route) -> Result<(), HostError> {
        let args = route_args(route);
        let mut command = vec!["route", "del"];
        command.extend(args.iter().map(String::as_str));
        command.extend(["dev", name]);
        self.run(&command).await?;
        Ok(())
    }
}

fn route_args(route: &Route) -> Vec<String> {
    let mut args = vec![route.destination.to_string()];
    if let Some(gateway) = route.gateway {
        args.push("via".into());
        args.push(gateway.to_string());
    }
    if let Some(source) = route.source {
        args.push("src".into());
        args.push(source.to_string());
    }
    args
}

/// Older iproute2 releases print nothing instead of `[]`.
fn decode<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>, serde_json::Error> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(stdout)
}

#[derive(Debug, Deserialize)]
struct RawLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    linkinfo: Option<RawLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct RawLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    // Shape depends on the link kind.
    #[serde(default)]
    info_data: Option<Value>,
}

impl RawLink {
    fn into_link(self) -> Link {
        let up = self.flags.iter().any(|flag| flag == "UP");
        let (kind, data) = match self.linkinfo {
            Some(info) => (info.info_kind, info.info_data),
            None => (None, None),
        };
        let endpoint = |key: &str| {
            data.as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<IpAddr>().ok())
        };
        Link {
            local: endpoint("local"),
            remote: endpoint("remote"),
            name: self.ifname,
            kind,
            up,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAddrIface {
    #[serde(default)]
    addr_info: Vec<RawAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct RawAddrInfo {
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
    #[serde(default)]
    scope: Option<String>,
}

impl RawAddrInfo {
    fn into_address(self) -> Option<Address> {
        let ip: IpAddr = self.local?.parse().ok()?;
        let prefix = self.prefixlen.unwrap_or(if ip.is_ipv4() { 32 } else { 128 });
        Some(Address {
            address: IpNet::new(ip, prefix).ok()?,
            scope: self.scope.as_deref().and_then(AddressScope::parse),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    prefsrc: Option<String>,
}

impl RawRoute {
    fn destination(&self, default: &str) -> Option<IpNet> {
        match self.dst.as_str() {
            "default" => default.parse().ok(),
            dst if dst.contains('/') => dst.parse().ok(),
            dst => dst.parse::<IpAddr>().ok().map(IpNet::from),
        }
    }

    fn into_route(self, default: &str) -> Option<Route> {
        let Some(destination) = self.destination(default) else {
            debug!("Skipping route with unreadable destination [{}]", self.dst);
            return None;
        };
        Some(Route {
            destination,
            source: self.prefsrc.and_then(|s| s.parse().ok()),
            gateway: self.gateway.and_then(|s| s.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tunnel_links() {
        let json = r#"[
            {"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"mtu":65536},
            {"ifindex":7,"ifname":"cni.4242","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],
             "link_type":"ipip","linkinfo":{"info_kind":"ipip",
             "info_data":{"proto":"ip","remote":"10.0.0.5","local":"10.0.0.1","ttl":0,"pmtudisc":true}}},
            {"ifindex":8,"ifname":"tunl0","flags":["NOARP"],
             "linkinfo":{"info_kind":"ipip","info_data":{"proto":"ip","remote":"any","local":"any"}}},
            {"ifindex":9,"ifname":"br0","flags":["UP"],"linkinfo":{"info_kind":"bridge","info_data":{"stp_state":0}}}
        ]"#;
        let links: Vec<Link> = decode::<RawLink>(json)
            .unwrap()
            .into_iter()
            .map(RawLink::into_link)
            .collect();

        assert_eq!(links.len(), 4);
        assert_eq!(links[0].kind, None);
        assert_eq!(
            links[1],
            Link {
                name: "cni.4242".into(),
                kind: Some("ipip".into()),
                up: true,
                local: Some("10.0.0.1".parse().unwrap()),
                remote: Some("10.0.0.5".parse().unwrap()),
            }
        );
        assert!(!links[2].up);
        assert_eq!(links[2].remote, None);
        assert_eq!(links[3].local, None);
    }

    #[test]
    fn parses_addresses_with_scope() {
        let json = r#"[{"ifindex":7,"ifname":"cni.4242","addr_info":[
            {"family":"inet","local":"10.244.0.1","prefixlen":32,"scope":"global"},
            {"family":"inet6","local":"fe80::5efe:a00:1","prefixlen":64,"scope":"link"}
        ]}]"#;
        let addresses: Vec<Address> = decode::<RawAddrIface>(json)
            .unwrap()
            .into_iter()
            .flat_map(|i| i.addr_info)
            .filter_map(RawAddrInfo::into_address)
            .collect();

        assert_eq!(addresses.len(), 2);
        assert!(addresses[0].is_global());
        assert_eq!(addresses[0].address.to_string(), "10.244.0.1/32");
        assert_eq!(addresses[1].scope, Some(AddressScope::Link));
    }

    #[test]
    fn parses_routes() {
        let json = r#"[
            {"dst":"10.1.0.0/24","scope":"link","flags":[]},
            {"dst":"default","gateway":"10.0.0.9","flags":[]},
            {"dst":"192.168.7.7","prefsrc":"10.244.0.1","scope":"link","flags":[]}
        ]"#;
        let routes: Vec<Route> = decode::<RawRoute>(json)
            .unwrap()
            .into_iter()
            .filter_map(|r| r.into_route("0.0.0.0/0"))
            .collect();

        assert_eq!(routes[0], Route::direct("10.1.0.0/24".parse().unwrap()));
        assert_eq!(routes[1].destination.to_string(), "0.0.0.0/0");
        assert_eq!(routes[1].gateway, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(routes[2].destination.to_string(), "192.168.7.7/32");
        assert!(!routes[2].is_direct());
    }

    #[test]
    fn unreadable_route_destinations_are_skipped() {
        let json = r#"[
            {"dst":"blackhole-ish","flags":[]},
            {"dst":"10.2.0.0/99","flags":[]},
            {"dst":"10.2.0.0/24","flags":[]}
        ]"#;
        let routes: Vec<Route> = decode::<RawRoute>(json)
            .unwrap()
            .into_iter()
            .filter_map(|r| r.into_route("0.0.0.0/0"))
            .collect();

        assert_eq!(routes, vec![Route::direct("10.2.0.0/24".parse().unwrap())]);
    }

    #[test]
    fn empty_output_is_an_empty_list() {
        assert!(decode::<RawRoute>("\n").unwrap().is_empty());
        assert!(decode::<RawRoute>("[]").unwrap().is_empty());
    }

    #[test]
    fn route_args_include_gateway_and_source() {
        let route = Route {
            destination: "10.9.0.0/16".parse().unwrap(),
            source: Some("10.244.0.1".parse().unwrap()),
            gateway: Some("10.0.0.9".parse().unwrap()),
        };
        assert_eq!(
            route_args(&route),
            vec!["10.9.0.0/16", "via", "10.0.0.9", "src", "10.244.0.1"]
        );
    }
}
