//! On-disk layout of the configuration tree
//!
//! ```text
//! <confroot>/config.toml
//! <confroot>/site_<name>/config.toml
//! <confroot>/site_<name>/node_<name>/config.toml
//! <confroot>/generated/config.toml
//! <confroot>/effective/node_<id>/{tmp,new,v<N>,active}
//! ```

use std::path::{Path, PathBuf};

use crate::NodeId;

/// Name of the configuration file in every layer directory
pub const CONFIG_FILE: &str = "config.toml";
pub const SITE_DIR_PREFIX: &str = "site_";
pub const NODE_DIR_PREFIX: &str = "node_";
pub const STAGING_DIR: &str = "tmp";
pub const CANDIDATE_DIR: &str = "new";
pub const ACTIVE_LINK: &str = "active";

/// Resolves paths below the configuration root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn global_config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn site_dir(&self, site: &str) -> PathBuf {
        self.root.join(format!("{SITE_DIR_PREFIX}{site}"))
    }

    pub fn node_dir(&self, site: &str, node: &str) -> PathBuf {
        self.site_dir(site).join(format!("{NODE_DIR_PREFIX}{node}"))
    }

    pub fn generated_config(&self) -> PathBuf {
        self.root.join("generated").join(CONFIG_FILE)
    }

    pub fn effective_dir(&self) -> PathBuf {
        self.root.join("effective")
    }

    /// Directory holding staging, candidate, versions and the active pointer of one node
    pub fn effective_node_dir(&self, node_id: NodeId) -> PathBuf {
        self.effective_dir().join(format!("{NODE_DIR_PREFIX}{node_id}"))
    }

    pub fn staging_dir(&self, node_id: NodeId) -> PathBuf {
        self.effective_node_dir(node_id).join(STAGING_DIR)
    }

    pub fn candidate_dir(&self, node_id: NodeId) -> PathBuf {
        self.effective_node_dir(node_id).join(CANDIDATE_DIR)
    }

    pub fn version_dir(&self, node_id: NodeId, version: u32) -> PathBuf {
        self.effective_node_dir(node_id).join(version_name(version))
    }

    pub fn active_link(&self, node_id: NodeId) -> PathBuf {
        self.effective_node_dir(node_id).join(ACTIVE_LINK)
    }

    /// Lock file serializing writers of one node; lives next to the node directory
    /// so that it is never part of a mirrored bundle.
    pub fn node_lock(&self, node_id: NodeId) -> PathBuf {
        self.effective_dir()
            .join(format!("{NODE_DIR_PREFIX}{node_id}.lock"))
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }
}

/// Directory name of a version (`v3`)
pub fn version_name(version: u32) -> String {
    format!("v{version}")
}

/// Parses a version directory name; `None` for anything that is not `v<digits>`
pub fn parse_version_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('v')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Site and node names must not be purely numeric (reserved for id lookup)
pub fn is_numeric(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}
