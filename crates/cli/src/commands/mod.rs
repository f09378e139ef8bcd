//! CLI Commands

use clap::Subcommand;
use serde::Serialize;
use wgmesh_common::controller::Selection;
use wgmesh_common::{activation, versions, Controller, NodeId};

use crate::output::TableDisplay;

pub mod activate;
pub mod ansible;
pub mod attach;
pub mod commit;
pub mod git;
pub mod inventory;
pub mod settings;

/// Which nodes a command applies to
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Nodes {
    /// All nodes of all sites
    All,
    /// All nodes of one site
    Site {
        /// Site name
        site: String,
    },
    /// A single node
    Node {
        /// `<node>.<site>` or node id
        node: String,
    },
}

impl From<Nodes> for Selection {
    fn from(nodes: Nodes) -> Self {
        match nodes {
            Nodes::All => Selection::All,
            Nodes::Site { site } => Selection::Site(site),
            Nodes::Node { node } => Selection::Node(node),
        }
    }
}

/// One node as shown by `list`
#[derive(Serialize, Clone, Debug)]
pub struct NodeDisplay {
    pub id: NodeId,
    pub name: String,
    pub site: String,
    pub mgmt_address: Option<String>,
    pub latest: Option<u32>,
    pub active: Option<u32>,
}

impl NodeDisplay {
    /// Rows for `nodes`, ordered by site and node name
    pub fn collect(controller: &mut Controller, nodes: &[NodeId]) -> anyhow::Result<Vec<Self>> {
        let mut rows = Vec::with_capacity(nodes.len());
        for &id in nodes {
            let (name, site) = {
                let entry = controller.store().node(id)?;
                (entry.name.clone(), entry.site.clone())
            };
            let layout = controller.layout().clone();
            rows.push(Self {
                id,
                name,
                site,
                mgmt_address: controller.mgmt_address(id)?,
                latest: versions::latest_version(&layout, id)?,
                active: activation::active_version(&layout, id)?,
            });
        }
        rows.sort_by(|a, b| (&a.site, &a.name).cmp(&(&b.site, &b.name)));
        Ok(rows)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.site)
    }
}

fn version_cell(version: Option<u32>) -> String {
    version.map(|v| format!("v{v}")).unwrap_or_else(|| "-".to_string())
}

impl TableDisplay for NodeDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Node", "Management Address", "Latest", "Active"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.full_name(),
            self.mgmt_address
                .clone()
                .unwrap_or_else(|| "(not attached)".to_string()),
            version_cell(self.latest),
            version_cell(self.active),
        ]
    }
}
