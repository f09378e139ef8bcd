//! Switch nodes to a committed configuration version

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use wgmesh_common::activation::ActivationOutcome;
use wgmesh_common::controller::Selection;
use wgmesh_common::VersionSelector;

use crate::context::Context;
use crate::output::{print_list, TableDisplay};

#[derive(Subcommand)]
pub enum ActivateCommands {
    /// Activate the latest version on all nodes
    All,
    Site {
        site: String,
        /// `latest` or a version such as `v3`
        #[arg(id = "version_selector", value_name = "VERSION", default_value = "latest")]
        version: String,
    },
    Node {
        /// `<node>.<site>` or node id
        node: String,
        /// `latest` or a version such as `v3`
        #[arg(id = "version_selector", value_name = "VERSION", default_value = "latest")]
        version: String,
    },
}

impl ActivateCommands {
    fn into_parts(self) -> Result<(Selection, VersionSelector)> {
        Ok(match self {
            Self::All => (Selection::All, VersionSelector::Latest),
            Self::Site { site, version } => (Selection::Site(site), version.parse()?),
            Self::Node { node, version } => (Selection::Node(node), version.parse()?),
        })
    }
}

#[derive(Serialize)]
pub struct ActivationDisplay {
    pub node: String,
    pub outcome: String,
}

impl TableDisplay for ActivationDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Node", "Outcome"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.node.clone(), self.outcome.clone()]
    }
}

fn describe(outcome: &ActivationOutcome) -> String {
    match outcome {
        ActivationOutcome::Activated(v) => format!("activated v{v}"),
        ActivationOutcome::Skipped(reason) => format!("skipped: {reason}"),
        ActivationOutcome::Failed(reason) => format!("failed: {reason}"),
    }
}

pub fn execute(cmd: ActivateCommands, ctx: &Context) -> Result<()> {
    let (selection, selector) = cmd.into_parts()?;
    let mut controller = ctx.open_controller()?;
    let ids = controller.select(&selection)?;

    let report = controller.activate(&ids, selector);
    let mut rows = Vec::with_capacity(report.outcomes.len());
    for (id, outcome) in &report.outcomes {
        rows.push(ActivationDisplay {
            node: controller.store().node(*id)?.full_name(),
            outcome: describe(outcome),
        });
    }
    print_list(&rows, ctx.format, "No nodes selected");

    if report.failed() > 0 {
        bail!("Activation failed for {} of {} node(s)", report.failed(), ids.len());
    }
    Ok(())
}
