//! External programs: rsync, ansible, git, ping and systemctl

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Render a command line for logs and error messages
fn display(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Run a command capturing its output; non-zero exit is an error
pub fn run_captured(cmd: &mut Command) -> Result<Output> {
    let line = display(cmd);
    debug!("Executing [{}]", line);
    let output = cmd.output().map_err(|e| Error::CommandFailed {
        command: line.clone(),
        reason: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: line,
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(output)
}

/// Run a command attached to the terminal; non-zero exit is an error
pub fn run_interactive(cmd: &mut Command) -> Result<()> {
    let line = display(cmd);
    debug!("Executing [{}]", line);
    let status = cmd.status().map_err(|e| Error::CommandFailed {
        command: line.clone(),
        reason: e.to_string(),
    })?;
    if !status.success() {
        return Err(Error::CommandFailed {
            command: line,
            reason: status.to_string(),
        });
    }
    Ok(())
}

/// Pushes committed bundles to a node
pub trait Distributor: Send + Sync {
    /// Mirror all committed versions (`tmp`, `new` and `active` excluded)
    fn mirror_configs(&self, node_dir: &Path, host: &str) -> Result<()>;

    /// Push the active pointer; the node-side helper switches to it
    fn mirror_active(&self, node_dir: &Path, host: &str) -> Result<()>;
}

/// Distribution with rsync over ssh
#[derive(Debug, Clone)]
pub struct Rsync {
    /// Directory on the node receiving the versions
    pub dest_path: PathBuf,
    /// Node-side program run via `--rsync-path` when pushing `active`
    pub helper: PathBuf,
}

impl Rsync {
    pub fn new(dest_path: impl Into<PathBuf>, helper: impl Into<PathBuf>) -> Self {
        Self {
            dest_path: dest_path.into(),
            helper: helper.into(),
        }
    }

    fn destination(&self, host: &str) -> String {
        format!("[{host}]:{}", self.dest_path.display())
    }
}

impl Distributor for Rsync {
    fn mirror_configs(&self, node_dir: &Path, host: &str) -> Result<()> {
        let mut cmd = Command::new("rsync");
        cmd.args(["-a", "-q"])
            .args(["--exclude=tmp", "--exclude=new", "--exclude=active"])
            .arg(format!("{}/", node_dir.display()))
            .arg(self.destination(host));
        run_captured(&mut cmd).map(|_| ())
    }

    fn mirror_active(&self, node_dir: &Path, host: &str) -> Result<()> {
        let mut cmd = Command::new("rsync");
        cmd.args(["-a", "-q"])
            .arg(format!("--rsync-path={}", self.helper.display()))
            .arg(node_dir.join(crate::layout::ACTIVE_LINK))
            .arg(self.destination(host));
        run_captured(&mut cmd).map(|_| ())
    }
}

/// Calls ansible and ansible-playbook
#[derive(Debug, Clone)]
pub struct Ansible {
    /// Directory the commands run in (holds playbooks and ansible.cfg)
    pub working_dir: PathBuf,
    pub playbook: PathBuf,
}

impl Ansible {
    pub fn new(working_dir: impl Into<PathBuf>, playbook: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            playbook: playbook.into(),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if self.working_dir.is_dir() {
            cmd.current_dir(&self.working_dir);
        }
        cmd
    }

    /// Run the provisioning playbook against one freshly attached node
    pub fn provision_node(&self, node_fullname: &str, address: &str) -> Result<()> {
        info!(
            "Provisioning node [{}@{}] with playbook {:?}",
            node_fullname, address, self.playbook
        );
        let mut cmd = self.command("ansible-playbook");
        cmd.arg(&self.playbook)
            .arg("-i")
            .arg(format!("{address},"))
            .arg("--extra-vars")
            .arg(format!("variable_host={address}"));
        run_interactive(&mut cmd)
    }

    /// Run `ansible` / `ansible-playbook` for nodes keyed by full name.
    /// Nodes without a management address are skipped.
    pub fn run_for_nodes(
        &self,
        nodes: &BTreeMap<String, Option<String>>,
        args: &[String],
        playbook: bool,
    ) -> Result<()> {
        let program = if playbook { "ansible-playbook" } else { "ansible" };
        let attached: Vec<&str> = nodes
            .values()
            .filter_map(|addr| addr.as_deref())
            .collect();
        let skipped: Vec<&str> = nodes
            .iter()
            .filter(|(_, addr)| addr.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        info!(
            "Calling [{}] for {} node(s); skipping non-attached node(s) [{}]",
            program,
            attached.len(),
            skipped.join(", ")
        );
        if attached.is_empty() {
            return Err(Error::config("no attached nodes selected"));
        }
        let mut cmd = self.command(program);
        cmd.arg("-i").arg(format!("{},", attached.join(","))).args(args);
        run_interactive(&mut cmd)
    }
}

const GITIGNORE: &str = "certs/\neffective/\ngenerated/\n";

/// Change tracking of the configuration tree
#[derive(Debug, Clone)]
pub struct Git {
    confroot: PathBuf,
}

impl Git {
    pub fn new(confroot: impl Into<PathBuf>) -> Self {
        Self {
            confroot: confroot.into(),
        }
    }

    /// Write the default `.gitignore` unless one exists
    pub fn ensure_gitignore(&self) -> Result<bool> {
        let path = self.confroot.join(".gitignore");
        if path.is_file() {
            return Ok(false);
        }
        fs::create_dir_all(&self.confroot)?;
        fs::write(&path, GITIGNORE)?;
        Ok(true)
    }

    /// `git -C <confroot> <args>`; failures are logged, not returned
    pub fn run(&self, args: &[String]) -> bool {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.confroot).args(args);
        info!("Executing [{}]", self::display(&cmd));
        match cmd.status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("Ignoring error when calling git [{}]", status);
                false
            }
            Err(e) => {
                warn!("Ignoring error when calling git [{}]", e);
                false
            }
        }
    }
}

/// Reachability probe
pub trait Pinger: Send + Sync {
    fn ping(&self, address: &str) -> bool;
}

/// One ICMP echo via `ping`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPing;

impl Pinger for SystemPing {
    fn ping(&self, address: &str) -> bool {
        let mut cmd = Command::new("ping");
        cmd.args(["-c", "1", "-W", "3", "-w", "3", "-q", address]);
        run_captured(&mut cmd).is_ok()
    }
}

/// Controls the management interface service
pub trait ServiceManager: Send + Sync {
    fn restart(&self, interface: &str) -> Result<()>;

    fn start_and_enable(&self, interface: &str) -> Result<()>;
}

/// `systemctl … wg-quick@<iface>`
#[derive(Debug, Clone, Copy, Default)]
pub struct Systemctl;

impl Systemctl {
    fn unit(interface: &str) -> String {
        format!("wg-quick@{interface}")
    }

    fn systemctl(action: &str, interface: &str) -> Result<()> {
        let mut cmd = Command::new("systemctl");
        cmd.arg(action).arg(Self::unit(interface));
        run_captured(&mut cmd).map(|_| ())
    }
}

impl ServiceManager for Systemctl {
    fn restart(&self, interface: &str) -> Result<()> {
        Self::systemctl("restart", interface)
    }

    fn start_and_enable(&self, interface: &str) -> Result<()> {
        Self::systemctl("start", interface)?;
        Self::systemctl("enable", interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gitignore_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path());
        assert!(git.ensure_gitignore().unwrap());
        assert!(!git.ensure_gitignore().unwrap());
        let content = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(content.contains("effective/"));
    }

    #[test]
    fn test_ansible_needs_attached_nodes() {
        let ansible = Ansible::new("/nonexistent", "node.yml");
        let nodes = BTreeMap::from([("a.s".to_string(), None)]);
        assert!(matches!(
            ansible.run_for_nodes(&nodes, &[], false),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_failed_command_reports_command_line() {
        let err = run_captured(Command::new("/nonexistent/tool").arg("x")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tool x"));
    }

    #[test]
    fn test_rsync_destination_brackets_ipv6() {
        let rsync = Rsync::new("/etc/wgmesh/configs", "/opt/helper");
        assert_eq!(
            rsync.destination("fe80::b%tlwg_mgmt"),
            "[fe80::b%tlwg_mgmt]:/etc/wgmesh/configs"
        );
    }
}
