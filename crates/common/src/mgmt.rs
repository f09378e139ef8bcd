//! Management WireGuard interface of the controller (`wg-quick` file)

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::write_atomic;
use crate::exec::ServiceManager;
use crate::keys::KeyGenerator;
use crate::settings::MgmtConfig;
use crate::{Error, NodeId, Result};

/// One `[Peer]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgPeer {
    pub comments: Vec<String>,
    pub attrs: Vec<(String, String)>,
}

impl WgPeer {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn allowed_ips(&self) -> Vec<&str> {
        self.get("AllowedIPs")
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Parsed `wg-quick` configuration; comments outside peers are not preserved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgQuickConfig {
    pub interface: Vec<(String, String)>,
    pub peers: Vec<WgPeer>,
}

impl WgQuickConfig {
    pub fn parse(content: &str) -> Result<Self> {
        enum Section {
            None,
            Interface,
            Peer,
        }
        let mut config = Self::default();
        let mut section = Section::None;
        let mut pending_comments = Vec::new();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                pending_comments.push(comment.trim().to_string());
                continue;
            }
            if line.eq_ignore_ascii_case("[Interface]") {
                section = Section::Interface;
                pending_comments.clear();
                continue;
            }
            if line.eq_ignore_ascii_case("[Peer]") {
                section = Section::Peer;
                config.peers.push(WgPeer {
                    comments: std::mem::take(&mut pending_comments),
                    attrs: Vec::new(),
                });
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::config(format!("line {}: expected key = value", lineno + 1))
            })?;
            let attr = (key.trim().to_string(), value.trim().to_string());
            match section {
                Section::Interface => config.interface.push(attr),
                Section::Peer => {
                    if let Some(peer) = config.peers.last_mut() {
                        peer.comments.append(&mut pending_comments);
                        peer.attrs.push(attr);
                    }
                }
                Section::None => {
                    return Err(Error::config(format!(
                        "line {}: attribute outside of a section",
                        lineno + 1
                    )))
                }
            }
        }
        Ok(config)
    }

    pub fn interface_attr(&self, key: &str) -> Option<&str> {
        self.interface
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::from("[Interface]\n");
        for (k, v) in &self.interface {
            let _ = writeln!(out, "{k} = {v}");
        }
        for peer in &self.peers {
            out.push('\n');
            for comment in &peer.comments {
                let _ = writeln!(out, "# {comment}");
            }
            out.push_str("[Peer]\n");
            for (k, v) in &peer.attrs {
                let _ = writeln!(out, "{k} = {v}");
            }
        }
        out
    }

    /// Drop the first peer whose AllowedIPs contain `allowed_ip`
    pub fn remove_peer_by_allowed_ip(&mut self, allowed_ip: &str) -> bool {
        match self
            .peers
            .iter()
            .position(|p| p.allowed_ips().contains(&allowed_ip))
        {
            Some(index) => {
                self.peers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn add_peer(&mut self, peer: WgPeer) {
        self.peers.push(peer);
    }
}

/// The controller's management interface
#[derive(Debug, Clone)]
pub struct MgmtInterface {
    pub name: String,
    path: PathBuf,
    config: WgQuickConfig,
}

impl MgmtInterface {
    /// Load the interface file, creating a basic configuration if it does not exist
    pub fn open_or_init(settings: &MgmtConfig, keygen: &dyn KeyGenerator) -> Result<Self> {
        let path = settings.config_path.clone();
        let config = match fs::read_to_string(&path) {
            Ok(content) => WgQuickConfig::parse(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let private_key = keygen.private_key().ok_or_else(|| {
                    Error::config("could not generate a private key for the management interface")
                })?;
                let config = WgQuickConfig {
                    interface: vec![
                        ("PrivateKey".into(), private_key),
                        ("ListenPort".into(), settings.listen_port.to_string()),
                        ("Address".into(), settings.address.clone()),
                    ],
                    peers: Vec::new(),
                };
                write_atomic(&path, config.render().as_bytes())?;
                info!("Created management interface configuration {:?}", path);
                config
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            name: settings.interface.clone(),
            path,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &WgQuickConfig {
        &self.config
    }

    pub fn public_key(&self, keygen: &dyn KeyGenerator) -> Result<String> {
        let private = self
            .config
            .interface_attr("PrivateKey")
            .ok_or_else(|| Error::config(format!("{:?} has no PrivateKey", self.path)))?;
        keygen
            .public_key(private)
            .ok_or_else(|| Error::config("deriving the management public key failed"))
    }

    /// Replace the peer of `node_id` (matched by its allowed link-local address)
    pub fn set_node_peer(
        &mut self,
        node_id: NodeId,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ip: &str,
    ) {
        if self.config.remove_peer_by_allowed_ip(allowed_ip) {
            debug!("Removed previous management peer of node {}", node_id);
        }
        let mut attrs = vec![("PublicKey".to_string(), public_key.to_string())];
        if let Some(psk) = preshared_key {
            attrs.push(("PresharedKey".to_string(), psk.to_string()));
        }
        attrs.push(("AllowedIPs".to_string(), allowed_ip.to_string()));
        self.config.add_peer(WgPeer {
            comments: vec![format!("Node {node_id}")],
            attrs,
        });
    }

    pub fn save(&self) -> Result<()> {
        write_atomic(&self.path, self.config.render().as_bytes())
    }

    pub fn restart(&self, services: &dyn ServiceManager) -> Result<()> {
        services.restart(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NativeKeyGenerator;

    const SAMPLE: &str = "[Interface]\nPrivateKey = abc\nListenPort = 51820\n\n# Node 11\n[Peer]\nPublicKey = p11\nAllowedIPs = fe80::b/128\n\n# Node 12\n[Peer]\nPublicKey = p12\nAllowedIPs = fe80::c/128, 10.0.0.1/32\n";

    #[test]
    fn test_parse_render() {
        let config = WgQuickConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.interface_attr("listenport"), Some("51820"));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].allowed_ips(), vec!["fe80::c/128", "10.0.0.1/32"]);
        assert_eq!(WgQuickConfig::parse(&config.render()).unwrap(), config);
    }

    #[test]
    fn test_remove_by_allowed_ip() {
        let mut config = WgQuickConfig::parse(SAMPLE).unwrap();
        assert!(config.remove_peer_by_allowed_ip("fe80::c/128"));
        assert!(!config.remove_peer_by_allowed_ip("fe80::c/128"));
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_init_and_replace_peer() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MgmtConfig {
            config_path: dir.path().join("tlwg_mgmt.conf"),
            ..MgmtConfig::default()
        };
        let mut mgmt = MgmtInterface::open_or_init(&settings, &NativeKeyGenerator).unwrap();
        assert!(mgmt.public_key(&NativeKeyGenerator).is_ok());

        mgmt.set_node_peer(11, "old", None, "fe80::b/128");
        mgmt.set_node_peer(11, "new", Some("psk"), "fe80::b/128");
        mgmt.save().unwrap();

        let reopened = MgmtInterface::open_or_init(&settings, &NativeKeyGenerator).unwrap();
        assert_eq!(reopened.config().peers.len(), 1);
        assert_eq!(reopened.config().peers[0].get("PublicKey"), Some("new"));
        assert_eq!(reopened.config().peers[0].comments, vec!["Node 11".to_string()]);
    }

    #[test]
    fn test_attribute_outside_section() {
        assert!(WgQuickConfig::parse("PrivateKey = x\n").is_err());
    }
}
