//! Mesh topology and per-link key material
//!
//! Every unordered pair of nodes is a [`Link`]. A link is active when its two
//! nodes share at least one group. Active links get two WireGuard key pairs, a
//! pre-shared key and a BGP password, generated once and kept in
//! `<confroot>/generated/config.toml`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{write_atomic, NodeIdentity};
use crate::keys::{KeyGenerator, WgKeyPair};
use crate::layout::Layout;
use crate::{Error, NodeId, Result};

/// Unordered node pair in canonical `(low, high)` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Link {
    low: NodeId,
    high: NodeId,
}

impl Link {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn low(&self) -> NodeId {
        self.low
    }

    pub fn high(&self) -> NodeId {
        self.high
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.low == node || self.high == node
    }

    /// The other endpoint, if `node` is one of the two
    pub fn peer_of(&self, node: NodeId) -> Option<NodeId> {
        if node == self.low {
            Some(self.high)
        } else if node == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl FromStr for Link {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.parse::<NodeId>()
                .map_err(|_| Error::CorruptState(format!("malformed link name [{s}]")))
        };
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| Error::CorruptState(format!("malformed link name [{s}]")))?;
        Ok(Link::new(parse(a)?, parse(b)?))
    }
}

/// Secrets of one active link; always stored complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub wg_preshared: String,
    pub bgp_password: String,
    /// Key pair per endpoint, keyed by node id
    pub keys: BTreeMap<String, WgKeyPair>,
}

impl KeyMaterial {
    /// Generate all secrets of a link; `None` if any of them could not be produced
    pub fn generate(link: Link, keygen: &dyn KeyGenerator) -> Option<Self> {
        let low = keygen.keypair()?;
        let high = keygen.keypair()?;
        let wg_preshared = keygen.preshared_key()?;
        Some(Self {
            wg_preshared,
            bgp_password: keygen.bgp_password(),
            keys: BTreeMap::from([
                (link.low().to_string(), low),
                (link.high().to_string(), high),
            ]),
        })
    }

    pub fn keypair(&self, node: NodeId) -> Option<&WgKeyPair> {
        self.keys.get(&node.to_string())
    }
}

/// Persisted state of one link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub active: bool,
    pub wg_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<KeyMaterial>,
}

/// Contents of `generated/config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedState {
    /// Keyed by canonical link name (`11-12`)
    #[serde(default)]
    pub links: BTreeMap<String, LinkRecord>,
    /// Active peers per node id
    #[serde(default)]
    pub neighbors: BTreeMap<String, Vec<NodeId>>,
}

impl GeneratedState {
    pub fn link(&self, link: Link) -> Option<&LinkRecord> {
        self.links.get(&link.to_string())
    }

    /// Links touching `node` together with the peer id, ordered by link name
    pub fn links_of(&self, node: NodeId) -> Result<Vec<(NodeId, &LinkRecord)>> {
        let mut out = Vec::new();
        for (name, record) in &self.links {
            let link: Link = name.parse()?;
            if let Some(peer) = link.peer_of(node) {
                out.push((peer, record));
            }
        }
        out.sort_by_key(|(peer, _)| *peer);
        Ok(out)
    }

    pub fn neighbors_of(&self, node: NodeId) -> &[NodeId] {
        self.neighbors
            .get(&node.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Maintains [`GeneratedState`] on disk
#[derive(Debug)]
pub struct TopologyEngine {
    path: PathBuf,
    state: GeneratedState,
    /// Serialized form of what is on disk; saves are skipped while unchanged
    persisted: Option<String>,
}

impl TopologyEngine {
    pub fn load(layout: &Layout) -> Result<Self> {
        let path = layout.generated_config();
        let (state, persisted) = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let state: GeneratedState =
                    toml::from_str(&content).map_err(|e| Error::TomlParse {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                let persisted = toml::to_string_pretty(&state)?;
                (state, Some(persisted))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (GeneratedState::default(), None)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state,
            persisted,
        })
    }

    pub fn state(&self) -> &GeneratedState {
        &self.state
    }

    /// Recompute all links from group memberships and provision missing material.
    ///
    /// Links whose material cannot be generated are left without material; the
    /// successful results are saved before the failures are reported.
    pub fn refresh(&mut self, nodes: &[NodeIdentity], keygen: &dyn KeyGenerator) -> Result<bool> {
        let mut neighbors: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        let mut failed = Vec::new();
        let mut visited = std::collections::BTreeSet::new();

        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let link = Link::new(a.node_id, b.node_id);
                let active = !a.groups.is_disjoint(&b.groups);
                if active {
                    neighbors
                        .entry(a.node_id.to_string())
                        .or_default()
                        .push(b.node_id);
                    neighbors
                        .entry(b.node_id.to_string())
                        .or_default()
                        .push(a.node_id);
                }

                visited.insert(link.to_string());
                let record = self.state.links.entry(link.to_string()).or_default();
                record.active = active;
                record.wg_active = active;
                if active && record.material.is_none() {
                    match KeyMaterial::generate(link, keygen) {
                        Some(material) => {
                            info!("Generated key material for link {}", link);
                            record.material = Some(material);
                        }
                        None => {
                            warn!("Generating key material for link {} failed", link);
                            failed.push(link.to_string());
                        }
                    }
                }
            }
        }

        // Links of removed nodes keep their material but carry no traffic
        for (name, record) in self.state.links.iter_mut() {
            if !visited.contains(name) {
                record.active = false;
                record.wg_active = false;
            }
        }

        for peers in neighbors.values_mut() {
            peers.sort_unstable();
        }
        self.state.neighbors = neighbors;
        let saved = self.save()?;

        if !failed.is_empty() {
            return Err(Error::TopologyProvisioning {
                links: failed.join(", "),
                reason: "key generator returned no output; is WireGuard installed and in the search path?"
                    .to_string(),
            });
        }
        Ok(saved)
    }

    /// Write the state if its serialized form differs from what is on disk
    pub fn save(&mut self) -> Result<bool> {
        let content = toml::to_string_pretty(&self.state)?;
        if self.persisted.as_deref() == Some(content.as_str()) {
            debug!("Generated config unchanged");
            return Ok(false);
        }
        write_atomic(&self.path, content.as_bytes())?;
        info!("Generated config saved due to change");
        self.persisted = Some(content);
        Ok(true)
    }
}
