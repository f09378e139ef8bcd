//! `ansible` / `ansible-playbook` against attached nodes

use anyhow::Result;
use clap::Subcommand;
use wgmesh_common::controller::Selection;
use wgmesh_common::exec::Ansible;

use crate::context::Context;
use crate::output::print_success;

#[derive(Subcommand)]
pub enum AnsibleCommands {
    All {
        /// Passed on to ansible
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Site {
        site: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Node {
        /// `<node>.<site>` or node id
        node: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl AnsibleCommands {
    fn into_parts(self) -> (Selection, Vec<String>) {
        match self {
            Self::All { args } => (Selection::All, args),
            Self::Site { site, args } => (Selection::Site(site), args),
            Self::Node { node, args } => (Selection::Node(node), args),
        }
    }
}

/// `playbook` selects `ansible-playbook` over `ansible`
pub fn execute(cmd: AnsibleCommands, ctx: &Context, playbook: bool) -> Result<()> {
    let (selection, args) = cmd.into_parts();
    let mut controller = ctx.open_controller()?;
    let ids = controller.select(&selection)?;
    let nodes = controller.mgmt_addresses(&ids)?;

    let provisioning = &ctx.settings.provisioning;
    Ansible::new(&provisioning.ansible_dir, &provisioning.playbook)
        .run_for_nodes(&nodes, &args, playbook)?;
    print_success("Done");
    Ok(())
}
