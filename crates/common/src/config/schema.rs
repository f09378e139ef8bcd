//! Typed views over the merged configuration
//!
//! Core logic consumes these structs instead of reaching into the flat
//! key/value maps by string.

use std::collections::BTreeSet;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use toml::Value;

use super::FlatConfig;
use crate::{Error, NodeId, Result};

pub const ATTR_NODE_ID: &str = "node_id";
pub const ATTR_GROUPS: &str = "groups";
pub const DEFAULT_GROUP: &str = "default";
pub const ATTR_NODE_HOSTNAME: &str = "node_hostname";
pub const ATTR_SSH_KEYS: &str = "node_sshauthkeys";
pub const ATTR_CONTROLLER_HOSTNAME: &str = "controller_hostname";
pub const ATTR_CONTROLLER_PORT: &str = "controller_wg_listenport";
pub const ATTR_CONTROLLER_PUBLIC: &str = "controller_wg_public";
pub const ATTR_MGMT_ADDRESS: &str = "attach_mgmt_address";
pub const ATTR_ATTACH_ADDRESS: &str = "attach_address";
pub const ATTR_ATTACH_MAC: &str = "attach_mac";
pub const ATTR_ATTACH_CONFIG_KEY: &str = "attach_config-key";
pub const ATTR_ATTACH_WG_PUBLIC: &str = "attach_wg_public";
pub const ATTR_ATTACH_WG_SHARED: &str = "attach_wg_shared";

/// Ephemeral attributes added to resolved views; never persisted
pub const ATTR_NODE_NAME: &str = "node_name";
pub const ATTR_SITE_NAME: &str = "site_name";
pub const ATTR_NODE_FULLNAME: &str = "node_fullname";
pub const ATTR_CONFIG_FILENAME: &str = "config_filename";

pub const DEFAULT_MGMT_PORT: u16 = 51820;

/// Controller-wide settings from the global layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub controller_hostname: Option<String>,
    pub controller_wg_listenport: u16,
    pub controller_wg_public: Option<String>,
    pub node_sshauthkeys: Vec<String>,
}

impl GlobalSettings {
    pub fn from_view(view: &FlatConfig) -> Result<Self> {
        Ok(Self {
            controller_hostname: view.get_str(ATTR_CONTROLLER_HOSTNAME).map(str::to_string),
            controller_wg_listenport: port(view, ATTR_CONTROLLER_PORT, DEFAULT_MGMT_PORT)?,
            controller_wg_public: view.get_str(ATTR_CONTROLLER_PUBLIC).map(str::to_string),
            node_sshauthkeys: view
                .get_str_list(ATTR_SSH_KEYS)
                .unwrap_or_default()
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        })
    }

    /// `<hostname>:<port>` of the controller's management interface
    pub fn management_endpoint(&self) -> Result<String> {
        let host = self
            .controller_hostname
            .as_deref()
            .ok_or_else(|| Error::config(format!("{ATTR_CONTROLLER_HOSTNAME} is not set")))?;
        Ok(format!("{host}:{}", self.controller_wg_listenport))
    }
}

/// Address plan keys; consumed by the compiler and not copied into node bundles
pub const NETWORK_PLAN_KEYS: &[&str] = &[
    "loopbacknet_ipv4",
    "loopbacknet_ipv6",
    "bgp_as_base",
    "internode_transfernet_ipv4",
    "internode_transfernet_ipv6",
    "wg_listenport_base",
];

/// Base networks and numbering from which per-node values are derived
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPlan {
    pub loopback_ipv4: IpNetwork,
    pub loopback_ipv6: IpNetwork,
    pub bgp_as_base: u32,
    pub transfer_ipv4: IpNetwork,
    pub transfer_ipv6: IpNetwork,
    pub wg_listenport_base: u16,
}

impl NetworkPlan {
    // 192.88.99.0/24 was the 6to4 relay anycast block; the ULA prefix was generated randomly
    pub const DEFAULT_LOOPBACK_IPV4: &'static str = "192.88.99.0/24";
    pub const DEFAULT_LOOPBACK_IPV6: &'static str = "fd3e:970c:e7ec:edb5::/64";
    pub const DEFAULT_TRANSFER_IPV6: &'static str = "fe80::/64";
    pub const DEFAULT_BGP_AS_BASE: u32 = 65000;
    pub const DEFAULT_WG_LISTENPORT_BASE: u16 = 51820;

    /// Read the plan, falling back to defaults for unset values.
    /// A value that is present but malformed is an error.
    pub fn from_view(view: &FlatConfig) -> Result<Self> {
        let loopback_ipv4 = network(view, "loopbacknet_ipv4", Self::DEFAULT_LOOPBACK_IPV4)?;
        let loopback_ipv6 = network(view, "loopbacknet_ipv6", Self::DEFAULT_LOOPBACK_IPV6)?;
        let transfer_ipv4 = match view.get("internode_transfernet_ipv4") {
            Some(_) => network(view, "internode_transfernet_ipv4", "")?,
            None => loopback_ipv4,
        };
        let transfer_ipv6 =
            network(view, "internode_transfernet_ipv6", Self::DEFAULT_TRANSFER_IPV6)?;

        let bgp_as_base = match view.get("bgp_as_base") {
            None => Self::DEFAULT_BGP_AS_BASE,
            Some(v) => v
                .as_integer()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| Error::config(format!("bgp_as_base is not a valid AS number: {v}")))?,
        };

        Ok(Self {
            loopback_ipv4,
            loopback_ipv6,
            bgp_as_base,
            transfer_ipv4,
            transfer_ipv6,
            wg_listenport_base: port(view, "wg_listenport_base", Self::DEFAULT_WG_LISTENPORT_BASE)?,
        })
    }
}

/// Identity and group membership of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub name: String,
    pub site: String,
    pub groups: BTreeSet<String>,
}

impl NodeIdentity {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.site)
    }

    /// Groups from the resolved view; nodes without any land in `default`
    pub fn groups_from_view(view: &FlatConfig) -> BTreeSet<String> {
        match view.get_str_list(ATTR_GROUPS) {
            Some(groups) => groups.into_iter().collect(),
            None => BTreeSet::from([DEFAULT_GROUP.to_string()]),
        }
    }
}

/// Fields reported by a device during enrollment, persisted in the node layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachRecord {
    pub scriptversion: Option<String>,
    pub address: Option<String>,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub recovery_key: Option<String>,
    pub config_key: Option<String>,
    pub wg_public: Option<String>,
    pub wg_addresses: Vec<String>,
    pub wg_shared: Option<String>,
}

impl AttachRecord {
    /// Layer attribute names paired with their values
    pub fn entries(&self) -> Vec<(&'static str, Option<Value>)> {
        let s = |v: &Option<String>| v.clone().map(Value::String);
        vec![
            ("attach_scriptversion", s(&self.scriptversion)),
            (ATTR_ATTACH_ADDRESS, s(&self.address)),
            (ATTR_ATTACH_MAC, s(&self.mac)),
            ("attach_hostname", s(&self.hostname)),
            ("attach_recovery-key", s(&self.recovery_key)),
            (ATTR_ATTACH_CONFIG_KEY, s(&self.config_key)),
            (ATTR_ATTACH_WG_PUBLIC, s(&self.wg_public)),
            (
                "attach_wg_addresses",
                Some(Value::Array(
                    self.wg_addresses.iter().cloned().map(Value::String).collect(),
                )),
            ),
            (ATTR_ATTACH_WG_SHARED, s(&self.wg_shared)),
        ]
    }
}

fn network(view: &FlatConfig, key: &str, default: &str) -> Result<IpNetwork> {
    let raw = match view.get(key) {
        None => default.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(Error::config(format!("{key} must be a CIDR string, got {other}")))
        }
    };
    raw.parse()
        .map_err(|e| Error::config(format!("{key} is not a valid network [{raw}]: {e}")))
}

fn port(view: &FlatConfig, key: &str, default: u16) -> Result<u16> {
    match view.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_integer()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| Error::config(format!("{key} is not a valid port: {v}"))),
    }
}
