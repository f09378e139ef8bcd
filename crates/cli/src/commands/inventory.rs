//! Sites and nodes: list, show, create, remove

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;

use super::NodeDisplay;
use crate::context::Context;
use crate::output::{print_config, print_list, print_success, TableDisplay};

#[derive(Subcommand)]
pub enum ListCommands {
    /// List all sites
    Sites,
    /// List the nodes of a site, or of all sites
    Nodes {
        /// Site name or `all`
        site: String,
    },
    /// List nodes whose next commit would create a new version
    Changed,
}

#[derive(Subcommand)]
pub enum ShowCommands {
    /// Attributes set in the global layer
    Global,
    /// Attributes set in a site layer
    Site { site: String },
    /// Attributes set in a node layer
    Node {
        /// `<node>.<site>` or node id
        node: String,
    },
}

/// Merged views, inherited attributes included
#[derive(Subcommand)]
pub enum ShowAllCommands {
    Site { site: String },
    Node {
        /// `<node>.<site>` or node id
        node: String,
    },
}

#[derive(Subcommand)]
pub enum CreateCommands {
    Site { site: String },
    Node {
        /// `<node>.<site>`
        node: String,
    },
}

#[derive(Subcommand)]
pub enum RemoveCommands {
    /// Remove a site without nodes
    Site { site: String },
    Node {
        /// `<node>.<site>` or node id
        node: String,
    },
}

#[derive(Serialize)]
pub struct SiteDisplay {
    pub name: String,
    pub nodes: usize,
}

impl TableDisplay for SiteDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Site", "Nodes"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone(), self.nodes.to_string()]
    }
}

/// Split `<node>.<site>` at the first dot
pub fn split_full_name(full: &str) -> Result<(&str, &str)> {
    match full.split_once('.') {
        Some((node, site)) if !node.is_empty() && !site.is_empty() => Ok((node, site)),
        _ => bail!("Node must be given as <node>.<site>, got [{full}]"),
    }
}

pub fn execute_list(cmd: ListCommands, ctx: &Context) -> Result<()> {
    let mut controller = ctx.open_controller()?;
    match cmd {
        ListCommands::Sites => {
            let store = controller.store();
            let mut sites = Vec::new();
            for name in store.site_names() {
                sites.push(SiteDisplay {
                    name: name.to_string(),
                    nodes: store.site_node_ids(name)?.len(),
                });
            }
            print_list(&sites, ctx.format, "There are no sites as of now");
        }
        ListCommands::Nodes { site } => {
            let ids = if site == "all" {
                controller.store().node_ids()
            } else {
                controller.store().site_node_ids(&site)?
            };
            let rows = NodeDisplay::collect(&mut controller, &ids)?;
            print_list(&rows, ctx.format, "There are no nodes as of now");
        }
        ListCommands::Changed => {
            ctx.ensure_management(&mut controller)?;
            let ids = controller.changed_nodes()?;
            let rows = NodeDisplay::collect(&mut controller, &ids)?;
            print_list(&rows, ctx.format, "No node configuration has changed");
        }
    }
    Ok(())
}

pub fn execute_show(cmd: ShowCommands, ctx: &Context) -> Result<()> {
    let controller = ctx.open_controller()?;
    let store = controller.store();
    let table = match cmd {
        ShowCommands::Global => store.global_layer().table(),
        ShowCommands::Site { site } => store.site_layer(&site)?.table(),
        ShowCommands::Node { node } => {
            let id = store.resolve_node_ref(&node)?;
            store.node(id)?.layer().table()
        }
    };
    print_config(table, ctx.format);
    Ok(())
}

pub fn execute_show_all(cmd: ShowAllCommands, ctx: &Context) -> Result<()> {
    let mut controller = ctx.open_controller()?;
    let store = controller.store_mut();
    let view = match cmd {
        ShowAllCommands::Site { site } => store.site_view(&site)?,
        ShowAllCommands::Node { node } => {
            let id = store.resolve_node_ref(&node)?;
            store.node_view(id)?
        }
    };
    print_config(&view.nested(), ctx.format);
    Ok(())
}

pub fn execute_create(cmd: CreateCommands, ctx: &Context) -> Result<()> {
    let mut controller = ctx.open_controller()?;
    match cmd {
        CreateCommands::Site { site } => {
            controller.store_mut().add_site(&site)?;
            print_success(&format!("Site '{}' created", site));
        }
        CreateCommands::Node { node } => {
            let (name, site) = split_full_name(&node)?;
            let id = controller.store_mut().add_node(name, site)?;
            print_success(&format!("Node '{}' created with id {}", node, id));
        }
    }
    Ok(())
}

pub fn execute_remove(cmd: RemoveCommands, ctx: &Context) -> Result<()> {
    let mut controller = ctx.open_controller()?;
    match cmd {
        RemoveCommands::Site { site } => {
            controller.store_mut().remove_site(&site)?;
            print_success(&format!("Site '{}' removed", site));
        }
        RemoveCommands::Node { node } => {
            let id = controller.store().resolve_node_ref(&node)?;
            controller.store_mut().remove_node(id)?;
            print_success(&format!("Node '{}' removed", node));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_full_name() {
        assert_eq!(split_full_name("a.berlin").unwrap(), ("a", "berlin"));
        assert!(split_full_name("a").is_err());
        assert!(split_full_name(".berlin").is_err());
        assert!(split_full_name("a.").is_err());
    }
}
