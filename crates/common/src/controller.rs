//! Orchestration: refresh → compile → promote → mirror → activate

use std::collections::BTreeMap;

use toml::Value;
use tracing::{debug, info, warn};

use crate::activation::{self, ActivationOutcome, ActivationReport, VersionSelector};
use crate::compiler;
use crate::config::schema::{
    ATTR_CONTROLLER_HOSTNAME, ATTR_CONTROLLER_PORT, ATTR_CONTROLLER_PUBLIC, ATTR_MGMT_ADDRESS,
    ATTR_SSH_KEYS,
};
use crate::config::{ConfigStore, Scope};
use crate::exec::Distributor;
use crate::keys::KeyGenerator;
use crate::layout::Layout;
use crate::lock::NodeLock;
use crate::settings::ControllerConfig;
use crate::template::TemplateRenderer;
use crate::topology::TopologyEngine;
use crate::versions::{self, PromoteOutcome};
use crate::{NodeId, Result};

/// Nodes an operator command applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Site(String),
    /// `<name>.<site>` or a node id
    Node(String),
}

/// Per-node results of a commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub outcomes: Vec<(NodeId, PromoteOutcome)>,
}

impl CommitReport {
    pub fn changed(&self) -> Vec<NodeId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.changed())
            .map(|(id, _)| *id)
            .collect()
    }
}

/// The controller: configuration tree plus the collaborators acting on it
pub struct Controller {
    store: ConfigStore,
    topology: TopologyEngine,
    settings: ControllerConfig,
    keygen: Box<dyn KeyGenerator>,
    distributor: Box<dyn Distributor>,
    renderer: TemplateRenderer,
}

impl Controller {
    pub fn open(
        layout: Layout,
        settings: ControllerConfig,
        keygen: Box<dyn KeyGenerator>,
        distributor: Box<dyn Distributor>,
    ) -> Result<Self> {
        let topology = TopologyEngine::load(&layout)?;
        let store = ConfigStore::open(layout)?;
        Ok(Self {
            store,
            topology,
            settings,
            keygen,
            distributor,
            renderer: TemplateRenderer::new(),
        })
    }

    pub fn layout(&self) -> &Layout {
        self.store.layout()
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConfigStore {
        &mut self.store
    }

    pub fn settings(&self) -> &ControllerConfig {
        &self.settings
    }

    pub fn keygen(&self) -> &dyn KeyGenerator {
        self.keygen.as_ref()
    }

    pub fn topology(&self) -> &TopologyEngine {
        &self.topology
    }

    /// Fill unset global defaults from the system
    pub fn ensure_defaults(&mut self) -> Result<()> {
        let mut defaults = Vec::new();

        let has_keys = self
            .store
            .global_settings()
            .map(|g| !g.node_sshauthkeys.is_empty())
            .unwrap_or(false);
        if !has_keys {
            let keyfile = &self.settings.ssh_public_key;
            match std::fs::read_to_string(keyfile) {
                Ok(key) if !key.trim().is_empty() => {
                    info!(
                        "No ssh public key set in global setting \"{}\"; defaulting to {:?}",
                        ATTR_SSH_KEYS, keyfile
                    );
                    defaults.push((
                        ATTR_SSH_KEYS.to_string(),
                        Value::Array(vec![Value::String(key.trim().to_string())]),
                    ));
                }
                _ => warn!(
                    "\"{}\" is not set and {:?} is not readable; create it with ssh-keygen",
                    ATTR_SSH_KEYS, keyfile
                ),
            }
        }

        if let Ok(host) = hostname::get() {
            defaults.push((
                ATTR_CONTROLLER_HOSTNAME.to_string(),
                Value::String(host.to_string_lossy().to_string()),
            ));
        }
        defaults.push((
            ATTR_CONTROLLER_PORT.to_string(),
            Value::Integer(i64::from(self.settings.mgmt.listen_port)),
        ));

        if self.store.ensure_global_defaults(defaults)? {
            info!("Stored default controller settings");
        }
        Ok(())
    }

    /// Record the management interface's public key
    pub fn set_controller_public_key(&mut self, public_key: &str) -> Result<bool> {
        self.store.set_attr(
            &Scope::Global,
            ATTR_CONTROLLER_PUBLIC,
            Some(Value::String(public_key.to_string())),
        )
    }

    pub fn select(&self, selection: &Selection) -> Result<Vec<NodeId>> {
        match selection {
            Selection::All => Ok(self.store.node_ids()),
            Selection::Site(site) => self.store.site_node_ids(site),
            Selection::Node(reference) => Ok(vec![self.store.resolve_node_ref(reference)?]),
        }
    }

    pub fn mgmt_address(&mut self, node_id: NodeId) -> Result<Option<String>> {
        Ok(self
            .store
            .node_view(node_id)?
            .get_str(ATTR_MGMT_ADDRESS)
            .map(str::to_string))
    }

    /// Recompute links and provision missing key material
    pub fn refresh_topology(&mut self) -> Result<bool> {
        let nodes = self.store.identities()?;
        self.topology.refresh(&nodes, self.keygen.as_ref())
    }

    /// Compile and promote one node under its lock
    pub fn commit_node(&mut self, node_id: NodeId, dry_run: bool) -> Result<PromoteOutcome> {
        let layout = self.store.layout().clone();
        let _lock = NodeLock::acquire(&layout, node_id)?;
        compiler::compile_node(
            &mut self.store,
            self.topology.state(),
            &self.renderer,
            node_id,
        )?;
        versions::promote(&layout, node_id, dry_run)
    }

    /// Refresh, then compile and promote the given nodes.
    /// Outside dry runs the versions of changed nodes are mirrored to attached devices.
    pub fn commit(&mut self, nodes: &[NodeId], dry_run: bool) -> Result<CommitReport> {
        self.refresh_topology()?;
        let mut report = CommitReport::default();
        for &node_id in nodes {
            let outcome = self.commit_node(node_id, dry_run)?;
            match outcome {
                PromoteOutcome::Committed(v) => info!("Node {} committed as v{}", node_id, v),
                PromoteOutcome::Unchanged => debug!("Node {} unchanged", node_id),
                PromoteOutcome::WouldCommit => debug!("Node {} would change", node_id),
            }
            report.outcomes.push((node_id, outcome));
        }
        if !dry_run {
            self.mirror(&report.changed())?;
        }
        Ok(report)
    }

    /// Nodes whose next commit would produce a new version
    pub fn changed_nodes(&mut self) -> Result<Vec<NodeId>> {
        let nodes = self.store.node_ids();
        Ok(self.commit(&nodes, true)?.changed())
    }

    /// Push all committed versions of the given nodes to their devices
    pub fn mirror(&mut self, nodes: &[NodeId]) -> Result<()> {
        for &node_id in nodes {
            let Some(address) = self.mgmt_address(node_id)? else {
                warn!(
                    "Node [{}] does not seem to have been attached; attach_mgmt_address is missing; skipping",
                    node_id
                );
                continue;
            };
            debug!("Mirroring config files for node [{}] to [{}]", node_id, address);
            let dir = self.layout().effective_node_dir(node_id);
            self.distributor.mirror_configs(&dir, &address)?;
        }
        Ok(())
    }

    /// Activate a version on each node; failures are reported per node
    pub fn activate(&mut self, nodes: &[NodeId], selector: VersionSelector) -> ActivationReport {
        let mut report = ActivationReport::default();
        for &node_id in nodes {
            let outcome = match self.activate_node(node_id, selector) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Activating node {} failed: {}", node_id, e);
                    ActivationOutcome::Failed(e.to_string())
                }
            };
            report.outcomes.push((node_id, outcome));
        }
        report
    }

    fn activate_node(&mut self, node_id: NodeId, selector: VersionSelector) -> Result<ActivationOutcome> {
        let address = self.mgmt_address(node_id)?;
        let layout = self.store.layout().clone();
        let _lock = NodeLock::acquire(&layout, node_id)?;
        activation::activate(
            &layout,
            node_id,
            selector,
            address.as_deref(),
            self.distributor.as_ref(),
        )
    }

    /// Full names mapped to management addresses, for the given nodes
    pub fn mgmt_addresses(&mut self, nodes: &[NodeId]) -> Result<BTreeMap<String, Option<String>>> {
        let mut out = BTreeMap::new();
        for &node_id in nodes {
            let name = self.store.node(node_id)?.full_name();
            out.insert(name, self.mgmt_address(node_id)?);
        }
        Ok(out)
    }
}
