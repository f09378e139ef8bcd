//! Git Commands
//!
//! Change tracking of the configuration root.

use anyhow::Result;
use clap::Args;
use tracing::debug;
use wgmesh_common::exec::Git;

use crate::context::Context;
use crate::output::print_warning;

#[derive(Args)]
pub struct GitArgs {
    /// Arguments for `git -C <confroot>`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn execute(args: GitArgs, ctx: &Context) -> Result<()> {
    let git = Git::new(&ctx.confroot);
    if git.ensure_gitignore()? {
        debug!("Wrote default .gitignore");
    }
    if !git.run(&args.args) {
        print_warning("git did not succeed");
    }
    Ok(())
}
