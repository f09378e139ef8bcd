//! wgmesh CLI - Main Entry Point
//!
//! Operator interface of the wgmesh controller: sites and nodes, their
//! layered attributes, committing and activating configuration versions,
//! attaching devices and running ansible against them.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;
use wgmesh_common::exception_log;

mod commands;
mod context;
mod output;

use commands::{activate, ansible, attach, commit, git, inventory, settings, Nodes};
use context::Context;

/// wgmesh - WireGuard mesh controller
#[derive(Parser)]
#[command(name = "wgmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration root
    #[arg(long, env = "WGMESH_CONFROOT", default_value = "/etc/wgmesh", global = true)]
    confroot: PathBuf,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sites, nodes or changed nodes
    #[command(subcommand)]
    List(inventory::ListCommands),

    /// Show the attributes set in one layer
    #[command(subcommand)]
    Show(inventory::ShowCommands),

    /// Show the merged attributes of a site or node
    #[command(subcommand)]
    ShowAll(inventory::ShowAllCommands),

    /// Create a site or node
    #[command(subcommand)]
    Create(inventory::CreateCommands),

    /// Remove a site or node
    #[command(subcommand)]
    Remove(inventory::RemoveCommands),

    /// Set an attribute; the value `empty` deletes it
    #[command(subcommand)]
    Set(settings::SetCommands),

    /// Create new configuration versions and mirror them to the nodes
    #[command(subcommand)]
    Commit(Nodes),

    /// Activate a configuration version on the nodes
    #[command(subcommand)]
    Activate(activate::ActivateCommands),

    /// Attach a device as a node
    #[command(subcommand)]
    Attach(attach::AttachCommands),

    /// Run ansible against attached nodes
    #[command(subcommand)]
    Ansible(ansible::AnsibleCommands),

    /// Run ansible-playbook against attached nodes
    #[command(subcommand)]
    AnsiblePlaybook(ansible::AnsibleCommands),

    /// Run git in the configuration root
    Git(git::GitArgs),

    /// Show version information
    Version,
}

impl Cli {
    fn log_level(&self) -> &str {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level.as_str(),
            (None, true) => "debug",
            (None, false) => "info",
        }
    }
}

async fn run(command: Commands, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Commands::List(cmd) => inventory::execute_list(cmd, ctx)?,
        Commands::Show(cmd) => inventory::execute_show(cmd, ctx)?,
        Commands::ShowAll(cmd) => inventory::execute_show_all(cmd, ctx)?,
        Commands::Create(cmd) => inventory::execute_create(cmd, ctx)?,
        Commands::Remove(cmd) => inventory::execute_remove(cmd, ctx)?,
        Commands::Set(cmd) => settings::execute(cmd, ctx)?,
        Commands::Commit(nodes) => commit::execute(nodes, ctx)?,
        Commands::Activate(cmd) => activate::execute(cmd, ctx)?,
        Commands::Attach(cmd) => attach::execute(cmd, ctx).await?,
        Commands::Ansible(cmd) => ansible::execute(cmd, ctx, false)?,
        Commands::AnsiblePlaybook(cmd) => ansible::execute(cmd, ctx, true)?,
        Commands::Git(args) => git::execute(args, ctx)?,
        Commands::Version => {
            println!("wgmesh v{}", wgmesh_common::VERSION);
        }
    }
    Ok(())
}

/// Operator mistakes and cancellations are reported, not logged as exceptions
fn is_operator_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<wgmesh_common::Error>()
        .map(|e| e.is_validation() || matches!(e, wgmesh_common::Error::Cancelled(_)))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level())),
        )
        .with_target(false)
        .init();

    let ctx = match Context::load(cli.confroot.clone(), cli.format) {
        Ok(ctx) => ctx,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            std::process::exit(1);
        }
    };

    // Exit explicitly: a prompt still blocked on stdin must not keep the runtime alive
    if let Err(e) = run(cli.command, &ctx).await {
        output::print_error(&format!("{e:#}"));
        if !is_operator_error(&e) {
            let report = exception_log::error_report(e.as_ref(), e.backtrace());
            if let Err(log_err) = exception_log::append(&ctx.settings.exception_log, &report) {
                debug!("Could not write exception log: {}", log_err);
            } else {
                output::print_message(
                    &format!(
                        "Details were appended to {}",
                        ctx.settings.exception_log.display()
                    ),
                    ctx.format,
                );
            }
        }
        std::process::exit(1);
    }
    std::process::exit(0);
}
