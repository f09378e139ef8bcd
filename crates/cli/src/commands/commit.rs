//! Compile, version and mirror effective configuration

use anyhow::Result;
use serde::Serialize;
use wgmesh_common::PromoteOutcome;

use super::Nodes;
use crate::context::Context;
use crate::output::{print_info, print_list, TableDisplay};

#[derive(Serialize)]
pub struct CommitDisplay {
    pub node: String,
    pub version: u32,
}

impl TableDisplay for CommitDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Node", "New Version"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.node.clone(), format!("v{}", self.version)]
    }
}

pub fn execute(nodes: Nodes, ctx: &Context) -> Result<()> {
    let mut controller = ctx.open_controller()?;
    ctx.ensure_management(&mut controller)?;
    let ids = controller.select(&nodes.into())?;

    print_info(&format!("Committing configuration of {} node(s)...", ids.len()));
    let report = controller.commit(&ids, false)?;

    let mut committed = Vec::new();
    for (id, outcome) in &report.outcomes {
        if let PromoteOutcome::Committed(version) = outcome {
            committed.push(CommitDisplay {
                node: controller.store().node(*id)?.full_name(),
                version: *version,
            });
        }
    }
    print_list(
        &committed,
        ctx.format,
        "No node configuration has changed; no new version created",
    );
    Ok(())
}
