//! Attaching a node end to end: handshake, persistence, management peer,
//! reachability check and provisioning

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use toml::Value;
use tracing::{debug, info};
use wgmesh_common::addressing::{mgmt_address, mgmt_allowed_ip};
use wgmesh_common::config::schema::{
    ATTR_ATTACH_ADDRESS, ATTR_ATTACH_MAC, ATTR_MGMT_ADDRESS, ATTR_NODE_HOSTNAME,
};
use wgmesh_common::config::FlatConfig;
use wgmesh_common::exec::{Ansible, Pinger, ServiceManager};
use wgmesh_common::mgmt::MgmtInterface;
use wgmesh_common::template::TemplateRenderer;
use wgmesh_common::{Controller, Error, NodeId, Result, Scope};

use crate::bootstrap::BootstrapData;
use crate::fsm::{DeviceReport, Target};
use crate::session::{stdin_chooser, Handshake, Mode, Timeouts};
use crate::tls::create_tls_acceptor;

/// Target recorded in the node's configuration, for non-interactive attachment
pub fn preselected_target(node_id: NodeId, view: &FlatConfig) -> Result<Target> {
    let raw = view.get_str(ATTR_ATTACH_ADDRESS).ok_or_else(|| {
        Error::config(format!(
            "Not attaching. \"{ATTR_ATTACH_ADDRESS}\" is not set for node {node_id}"
        ))
    })?;
    let address: IpAddr = raw
        .parse()
        .map_err(|e| Error::config(format!("{ATTR_ATTACH_ADDRESS} [{raw}] is invalid: {e}")))?;
    Ok(Target {
        address,
        mac: view.get_str(ATTR_ATTACH_MAC).map(str::to_string),
    })
}

pub struct Attacher {
    services: Box<dyn ServiceManager>,
    pinger: Arc<dyn Pinger>,
    ansible: Ansible,
}

impl Attacher {
    pub fn new(services: Box<dyn ServiceManager>, pinger: Arc<dyn Pinger>, ansible: Ansible) -> Self {
        Self {
            services,
            pinger,
            ansible,
        }
    }

    /// Attach `node_id` and return its management address
    pub async fn attach(
        &self,
        controller: &mut Controller,
        node_id: NodeId,
        interactive: bool,
    ) -> Result<String> {
        let settings = controller.settings().clone();
        let view = controller.store_mut().node_view(node_id)?;
        let mode = if interactive {
            Mode::Interactive(stdin_chooser())
        } else {
            Mode::Preselected(preselected_target(node_id, &view)?)
        };

        let data =
            BootstrapData::prepare(node_id, &view, &settings.mgmt.address, controller.keygen())?;
        let script = data.render(&TemplateRenderer::new())?;

        let confroot = controller.layout().root().to_path_buf();
        let tls = create_tls_acceptor(&settings.cert_path(&confroot), &settings.key_path(&confroot))?;
        let ip: IpAddr = settings.attach.listen.parse().map_err(|e| {
            Error::config(format!("invalid listen address [{}]: {e}", settings.attach.listen))
        })?;
        let listener = TcpListener::bind(SocketAddr::new(ip, settings.attach.port)).await?;

        let report = Handshake::new(listener, Some(tls), Timeouts::from(&settings.attach))
            .run(script, mode)
            .await?;
        info!(
            "Node configuration script has run completely. Updating local config and checking connectivity to node..."
        );

        let address = self.persist(controller, node_id, &data, &report)?;
        self.wait_reachable(&address, &settings.attach).await?;

        info!("Node is reachable via management connection. Provisioning node...");
        let fullname = controller.store().node(node_id)?.full_name();
        self.ansible.provision_node(&fullname, &address)?;
        info!("Node is attached and ready to be configured");
        Ok(address)
    }

    /// Store what the device reported and add it as a management peer.
    /// Returns the management address now recorded for the node.
    pub fn persist(
        &self,
        controller: &mut Controller,
        node_id: NodeId,
        data: &BootstrapData,
        report: &DeviceReport,
    ) -> Result<String> {
        let record = data.attach_record(report);
        let store = controller.store_mut();
        store.update_node(
            node_id,
            record
                .entries()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value)),
        )?;
        let has_hostname = store.node(node_id)?.layer().get(ATTR_NODE_HOSTNAME).is_some();
        if let (false, Some(hostname)) = (has_hostname, report.hostname()) {
            store.set_attr(
                &Scope::Node(node_id),
                ATTR_NODE_HOSTNAME,
                Some(Value::String(hostname.to_string())),
            )?;
        }

        let wg_public = record.wg_public.as_deref().ok_or_else(|| {
            Error::config(format!("node {node_id} did not report its WireGuard public key"))
        })?;
        let settings = controller.settings().clone();
        let mut mgmt = MgmtInterface::open_or_init(&settings.mgmt, controller.keygen())?;
        mgmt.set_node_peer(
            node_id,
            wg_public,
            Some(data.wg_shared.as_str()),
            &mgmt_allowed_ip(node_id)?,
        );
        mgmt.save()?;
        mgmt.restart(self.services.as_ref())?;

        let address = mgmt_address(node_id, &mgmt.name)?;
        controller.store_mut().set_attr(
            &Scope::Node(node_id),
            ATTR_MGMT_ADDRESS,
            Some(Value::String(address.clone())),
        )?;
        Ok(address)
    }

    async fn wait_reachable(
        &self,
        address: &str,
        settings: &wgmesh_common::settings::AttachConfig,
    ) -> Result<()> {
        debug!("Attempting to ping node via management interface to [{}]", address);
        for _ in 0..settings.ping_attempts {
            tokio::time::sleep(settings.tick()).await;
            let pinger = Arc::clone(&self.pinger);
            let target = address.to_string();
            if tokio::task::spawn_blocking(move || pinger.ping(&target))
                .await
                .unwrap_or(false)
            {
                return Ok(());
            }
        }
        Err(Error::ProtocolTimeout {
            phase: "waiting for the node to respond to ping via the management connection"
                .to_string(),
            seconds: settings.tick().as_secs() * u64::from(settings.ping_attempts),
        })
    }
}
