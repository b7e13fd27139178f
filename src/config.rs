use std::net::IpAddr;

use anyhow::{anyhow, bail};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{parse_cidrs, LocalContext};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name of this host's Node object.
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<IpAddr>,
    /// Pod ranges assigned to this host.
    pub pod_cidrs: Vec<String>,
    /// Path to the iproute2 `ip` binary.
    pub ip_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_ip: None,
            pod_cidrs: Vec::new(),
            ip_binary: "ip".into(),
        }
    }
}

impl Config {
    /// Layered sources, later ones winning. `NODE_NAME` is honoured as set
    /// by the downward API.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("tunnelmesh.toml"))
            .merge(Json::file("tunnelmesh.json"))
            .merge(Env::prefixed("TUNNELMESH_"))
            .merge(Env::raw().only(&["NODE_NAME"]))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow!("Failed to load configuration: {}", e))
    }

    /// Validates the host identity and derives its gateways.
    pub fn local_context(&self) -> anyhow::Result<LocalContext> {
        if self.node_name.is_empty() {
            bail!("node_name is not set");
        }
        let node_ip = self
            .node_ip
            .ok_or_else(|| anyhow!("node [{}] has no ip configured", self.node_name))?;
        let pod_cidrs = parse_cidrs(self.pod_cidrs.iter().map(String::as_str))
            .map_err(|e| anyhow!("cannot parse pod cidrs of node [{}]: {}", self.node_name, e))?;
        if pod_cidrs.is_empty() {
            bail!("node [{}] does not have a pod CIDR", self.node_name);
        }
        Ok(LocalContext::new(self.node_name.clone(), node_ip, pod_cidrs))
    }
}
