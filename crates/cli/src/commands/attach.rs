//! Enroll a device as a node

use std::sync::Arc;

use anyhow::Result;
use clap::Subcommand;
use wgmesh_attach::Attacher;
use wgmesh_common::exec::{Ansible, SystemPing, Systemctl};
use wgmesh_common::Error;

use crate::context::Context;
use crate::output::{print_info, print_success};

#[derive(Subcommand)]
pub enum AttachCommands {
    /// Hand the bootstrap script to a device and attach it as this node
    Node {
        /// `<node>.<site>` or node id
        node: String,

        /// Serve only the device recorded in `attach_address` instead of asking
        #[arg(long)]
        non_interactive: bool,
    },
}

pub async fn execute(cmd: AttachCommands, ctx: &Context) -> Result<()> {
    let AttachCommands::Node {
        node,
        non_interactive,
    } = cmd;

    let mut controller = ctx.open_controller()?;
    ctx.ensure_management(&mut controller)?;
    let node_id = controller.store().resolve_node_ref(&node)?;

    let provisioning = &ctx.settings.provisioning;
    let attacher = Attacher::new(
        Box::new(Systemctl),
        Arc::new(SystemPing),
        Ansible::new(&provisioning.ansible_dir, &provisioning.playbook),
    );

    print_info(&format!("Attaching node {} ({})", node, node_id));
    let address = tokio::select! {
        result = attacher.attach(&mut controller, node_id, !non_interactive) => result?,
        _ = tokio::signal::ctrl_c() => {
            return Err(Error::Cancelled("Node attach interrupted".to_string()).into());
        }
    };
    print_success(&format!(
        "Node {} is attached; management address {}",
        node, address
    ));
    Ok(())
}
