//! Controller (tool) configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the controller configuration file below the configuration root
pub const CONTROLLER_CONFIG_FILE: &str = "controller.toml";

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// File every unhandled error is appended to
    pub exception_log: PathBuf,

    /// Directory on the nodes that receives the version directories
    pub node_config_path: PathBuf,

    /// Helper run on the node side by rsync when switching the active version
    pub rsync_helper: PathBuf,

    /// Management interface
    pub mgmt: MgmtConfig,

    /// Attachment handshake
    pub attach: AttachConfig,

    /// Post-enrollment provisioning
    pub provisioning: ProvisioningConfig,

    /// Public key file used as default for `node_sshauthkeys`
    pub ssh_public_key: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            exception_log: PathBuf::from("/var/log/wgmesh_exceptions"),
            node_config_path: PathBuf::from("/etc/wgmesh/configs"),
            rsync_helper: PathBuf::from("/opt/wgmesh/bin/rsync-nodecfg.sh"),
            mgmt: MgmtConfig::default(),
            attach: AttachConfig::default(),
            provisioning: ProvisioningConfig::default(),
            ssh_public_key: PathBuf::from("/root/.ssh/id_rsa.pub"),
        }
    }
}

/// Management WireGuard interface of the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    pub interface: String,
    pub config_path: PathBuf,
    pub listen_port: u16,
    /// Controller-side link-local address
    pub address: String,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            interface: "tlwg_mgmt".to_string(),
            config_path: PathBuf::from("/etc/wireguard/tlwg_mgmt.conf"),
            listen_port: 51820,
            address: "fe80::1/64".to_string(),
        }
    }
}

/// Attachment handshake settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    pub listen: String,
    pub port: u16,
    /// Certificate and key; relative paths are taken below the configuration root
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub gathering_secs: u64,
    pub offering_secs: u64,
    pub observing_secs: u64,
    pub tick_millis: u64,
    pub ping_attempts: u32,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            listen: "::".to_string(),
            port: 8000,
            cert_path: PathBuf::from("certs/server.pem"),
            key_path: PathBuf::from("certs/key.pem"),
            gathering_secs: 20,
            offering_secs: 20,
            observing_secs: 20,
            tick_millis: 1000,
            ping_attempts: 20,
        }
    }
}

impl AttachConfig {
    pub fn gathering(&self) -> Duration {
        Duration::from_secs(self.gathering_secs)
    }

    pub fn offering(&self) -> Duration {
        Duration::from_secs(self.offering_secs)
    }

    pub fn observing(&self) -> Duration {
        Duration::from_secs(self.observing_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// Ansible provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub playbook: PathBuf,
    pub ansible_dir: PathBuf,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            playbook: PathBuf::from("node.yml"),
            ansible_dir: PathBuf::from("/etc/wgmesh/ansible"),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from file; defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content).map_err(|e| Error::TomlParse {
                path: path.display().to_string(),
                source: e,
            })?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Certificate path resolved against the configuration root
    pub fn cert_path(&self, confroot: &Path) -> PathBuf {
        confroot.join(&self.attach.cert_path)
    }

    pub fn key_path(&self, confroot: &Path) -> PathBuf {
        confroot.join(&self.attach.key_path)
    }
}
