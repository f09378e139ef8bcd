//! Effective per-node configuration and its rendered bundle

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::{debug, info};

use crate::addressing::{address, host_route, in_network};
use crate::config::schema::{ATTR_CONFIG_FILENAME, ATTR_NODE_HOSTNAME, NETWORK_PLAN_KEYS};
use crate::config::{ConfigStore, FlatConfig, NetworkPlan};
use crate::template::{TemplateRenderer, LINK_TEMPLATE, TEMPLATE_SUFFIX};
use crate::topology::GeneratedState;
use crate::{Error, NodeId, Result};

/// File name of the serialized effective configuration inside a bundle
pub const EFFECTIVE_CONFIG_FILE: &str = "config.yaml";

/// Suffixes of auxiliary files copied into a bundle
pub const AUX_SUFFIXES: &[&str] = &[".conf", TEMPLATE_SUFFIX];

/// Parent directories above the node directory searched for auxiliary files
pub const AUX_PARENT_LEVELS: usize = 2;

pub const DEFAULT_KEEPALIVE: i64 = 25;

/// Resolved, flattened configuration of one node
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub node_id: NodeId,
    flat: FlatConfig,
    /// Peers with a WireGuard-active link
    wg_peers: Vec<NodeId>,
}

impl EffectiveConfig {
    /// Merge the node's resolved hierarchy with derived addresses and link data
    pub fn build(store: &mut ConfigStore, state: &GeneratedState, node_id: NodeId) -> Result<Self> {
        let view = store.node_view(node_id)?;
        let plan = NetworkPlan::from_view(&view)?;

        let mut flat = view;
        for key in NETWORK_PLAN_KEYS {
            flat.remove(key);
        }
        flat.remove(ATTR_CONFIG_FILENAME);

        flat.insert("loopback_ipv4", host_route(&plan.loopback_ipv4, node_id)?);
        flat.insert("loopback_ipv6", host_route(&plan.loopback_ipv6, node_id)?);
        flat.insert("bgp_as", as_number(&plan, node_id));
        flat.insert("bgp_ipv4", address(&plan.loopback_ipv4, node_id)?);
        flat.insert("bgp_ipv6", address(&plan.loopback_ipv6, node_id)?);

        let mut wg_peers = Vec::new();
        for (peer, record) in state.links_of(node_id)? {
            let ifname = interface_name(peer);

            if record.wg_active {
                let prefix = format!("wg_links.{peer}");
                let material = record.material.as_ref().ok_or_else(|| {
                    Error::TopologyProvisioning {
                        links: format!("{}-{}", node_id.min(peer), node_id.max(peer)),
                        reason: "active link has no key material".to_string(),
                    }
                })?;
                let own = material.keypair(node_id);
                let theirs = material.keypair(peer);
                let peer_hostname = store
                    .node_view(peer)?
                    .get_str(ATTR_NODE_HOSTNAME)
                    .unwrap_or("localhost")
                    .to_string();
                let own_port = listen_port(&plan, node_id)?;

                let mut set = |key: &str, value: Value| flat.insert(format!("{prefix}.{key}"), value);
                set("wg_ifname", Value::String(ifname.clone()));
                set(
                    "wg_listenport",
                    Value::Integer(i64::from(listen_port(&plan, peer)?)),
                );
                set(
                    "wg_addresses",
                    strings([in_network(&plan.transfer_ipv6, node_id)?]),
                );
                set(
                    "wg_address_ipv4",
                    Value::String(host_route(&plan.transfer_ipv4, node_id)?),
                );
                set(
                    "wg_address_ipv6",
                    Value::String(host_route(&plan.transfer_ipv6, node_id)?),
                );
                set(
                    "wg_peer_address_ipv4",
                    Value::String(host_route(&plan.transfer_ipv4, peer)?),
                );
                set(
                    "wg_peer_address_ipv6",
                    Value::String(host_route(&plan.transfer_ipv6, peer)?),
                );
                set(
                    "wg_peer_endpoint",
                    Value::String(format!("{peer_hostname}:{own_port}")),
                );
                set(
                    "wg_peer_allowedips",
                    strings([
                        host_route(&plan.loopback_ipv4, peer)?,
                        host_route(&plan.loopback_ipv6, peer)?,
                        "0.0.0.0/0".to_string(),
                        "::/0".to_string(),
                    ]),
                );
                if let Some(own) = own {
                    set("wg_private", Value::String(own.private_key.clone()));
                }
                if let Some(theirs) = theirs {
                    set("wg_peer_public", Value::String(theirs.public_key.clone()));
                }
                set(
                    "wg_peer_preshared",
                    Value::String(material.wg_preshared.clone()),
                );

                let keepalive = format!("{prefix}.wg_peer_keepalive");
                if flat.get(&keepalive).is_none() {
                    flat.insert(keepalive, DEFAULT_KEEPALIVE);
                }
                wg_peers.push(peer);
            }

            if record.active {
                let prefix = format!("bgp_peers.{peer}");
                let mut set = |key: &str, value: Value| flat.insert(format!("{prefix}.{key}"), value);
                set("as", Value::Integer(as_number(&plan, peer)));
                set("name", Value::String(format!("node_{peer}")));
                set("ip", Value::String(address(&plan.loopback_ipv4, peer)?));
                set(
                    "loopback_ipv4",
                    Value::String(in_network(&plan.loopback_ipv4, peer)?),
                );
                set(
                    "loopback_ipv6",
                    Value::String(in_network(&plan.loopback_ipv6, peer)?),
                );
                set("ifname_local", Value::String(ifname));
                if let Some(material) = &record.material {
                    set("password", Value::String(material.bgp_password.clone()));
                }
            }
        }

        Ok(Self {
            node_id,
            flat,
            wg_peers,
        })
    }

    pub fn flat(&self) -> &FlatConfig {
        &self.flat
    }

    pub fn nested(&self) -> Table {
        self.flat.nested()
    }

    pub fn wg_peers(&self) -> &[NodeId] {
        &self.wg_peers
    }

    /// Data of one WireGuard link (`wg_links.<peer>`)
    pub fn link_data(&self, peer: NodeId) -> Option<Table> {
        self.nested()
            .get("wg_links")?
            .as_table()?
            .get(&peer.to_string())?
            .as_table()
            .cloned()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.nested())?)
    }
}

/// Compile one node into `effective/node_<id>/new/`, going through `tmp/`
pub fn compile_node(
    store: &mut ConfigStore,
    state: &GeneratedState,
    renderer: &TemplateRenderer,
    node_id: NodeId,
) -> Result<PathBuf> {
    let layout = store.layout().clone();
    let staging = layout.staging_dir(node_id);
    let candidate = layout.candidate_dir(node_id);

    let effective = EffectiveConfig::build(store, state, node_id)?;

    remove_dir_if_exists(&staging)?;
    fs::create_dir_all(&staging)?;
    fs::write(staging.join(EFFECTIVE_CONFIG_FILE), effective.to_yaml()?)?;

    let entry = store.node(node_id)?;
    let node_dir = layout.node_dir(&entry.site, &entry.name);
    let copied = copy_aux_files(&node_dir, &staging)?;
    debug!("Copied {} auxiliary file(s) for node {}", copied, node_id);

    render_templates(renderer, &effective, &staging)?;

    remove_dir_if_exists(&candidate)?;
    fs::rename(&staging, &candidate)?;
    info!("Compiled configuration of node {}", node_id);
    Ok(candidate)
}

/// Copy `.conf`/`.hbs` files from `node_dir` and its parents; the most specific directory wins
pub fn copy_aux_files(node_dir: &Path, dest: &Path) -> Result<usize> {
    let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
    let folders: Vec<&Path> = node_dir.ancestors().take(AUX_PARENT_LEVELS + 1).collect();

    for folder in folders.iter().rev() {
        let entries = match fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if AUX_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                files.insert(name, entry.path());
            }
        }
    }

    for (name, source) in &files {
        fs::copy(source, dest.join(name))?;
    }
    Ok(files.len())
}

/// Render every template in `dir`; the link template once per WireGuard link
fn render_templates(renderer: &TemplateRenderer, effective: &EffectiveConfig, dir: &Path) -> Result<()> {
    let data = effective.nested();
    let mut templates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.ends_with(TEMPLATE_SUFFIX) && name != LINK_TEMPLATE {
            templates.push(name);
        }
    }
    templates.sort();

    for name in templates {
        let target = name.trim_end_matches(TEMPLATE_SUFFIX);
        renderer.render_file(&dir.join(&name), &dir.join(target), &data)?;
    }

    let link_template = dir.join(LINK_TEMPLATE);
    if link_template.exists() {
        for peer in effective.wg_peers() {
            let link = effective.link_data(*peer).ok_or_else(|| Error::Template {
                template: LINK_TEMPLATE.to_string(),
                message: format!("no link data for peer {peer}"),
            })?;
            let target = format!("{}.conf", interface_name(*peer));
            renderer.render_file(&link_template, &dir.join(target), &link)?;
        }
    }
    Ok(())
}

/// WireGuard interface towards `peer`
pub fn interface_name(peer: NodeId) -> String {
    format!("tlwg_{peer}")
}

fn as_number(plan: &NetworkPlan, node_id: NodeId) -> i64 {
    i64::from(plan.bgp_as_base) + i64::from(node_id)
}

fn listen_port(plan: &NetworkPlan, node_id: NodeId) -> Result<u16> {
    u32::from(plan.wg_listenport_base)
        .checked_add(node_id)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| {
            Error::config(format!(
                "wg_listenport_base {} + {node_id} is not a valid port",
                plan.wg_listenport_base
            ))
        })
}

fn strings<I: IntoIterator<Item = String>>(items: I) -> Value {
    Value::Array(items.into_iter().map(Value::String).collect())
}

pub(crate) fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
