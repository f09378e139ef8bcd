//! What every command gets: configuration root, controller settings, output format

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use tracing::debug;
use wgmesh_common::exec::{Rsync, ServiceManager, Systemctl};
use wgmesh_common::mgmt::MgmtInterface;
use wgmesh_common::settings::CONTROLLER_CONFIG_FILE;
use wgmesh_common::{Controller, ControllerConfig, Layout, WgTool};

use crate::output::OutputFormat;

pub struct Context {
    pub confroot: PathBuf,
    pub settings: ControllerConfig,
    pub format: OutputFormat,
}

impl Context {
    /// Load `controller.toml` below `confroot`; defaults apply when it is absent
    pub fn load(confroot: PathBuf, format: OutputFormat) -> Result<Self> {
        let path = confroot.join(CONTROLLER_CONFIG_FILE);
        let settings = ControllerConfig::load(&path)
            .with_context(|| format!("loading controller settings from {}", path.display()))?;
        debug!(confroot = %confroot.display(), "Loaded controller settings");
        Ok(Self {
            confroot,
            settings,
            format,
        })
    }

    /// Open the configuration tree and fill unset controller defaults
    pub fn open_controller(&self) -> Result<Controller> {
        let mut controller = Controller::open(
            Layout::new(&self.confroot),
            self.settings.clone(),
            Box::new(WgTool::default()),
            Box::new(Rsync::new(
                &self.settings.node_config_path,
                &self.settings.rsync_helper,
            )),
        )?;
        controller.ensure_defaults()?;
        Ok(controller)
    }

    /// Make sure the management interface exists and runs, and record its public key
    pub fn ensure_management(&self, controller: &mut Controller) -> Result<()> {
        let mgmt = MgmtInterface::open_or_init(&self.settings.mgmt, controller.keygen())?;
        Systemctl
            .start_and_enable(&mgmt.name)
            .with_context(|| format!("starting management interface {}", mgmt.name))?;
        let public_key = mgmt.public_key(controller.keygen())?;
        if controller.set_controller_public_key(&public_key)? {
            debug!("Recorded management interface public key");
        }
        Ok(())
    }
}
