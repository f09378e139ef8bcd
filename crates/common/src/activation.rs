//! Active version pointer and distribution to the node

use std::fmt;
use std::fs;
use std::str::FromStr;

use tracing::{info, warn};

use crate::exec::Distributor;
use crate::layout::{version_name, Layout, ACTIVE_LINK};
use crate::versions::latest_version;
use crate::{Error, NodeId, Result};

/// Which committed version to activate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// Highest committed version at call time
    #[default]
    Latest,
    Version(u32),
}

impl FromStr for VersionSelector {
    type Err = Error;

    /// `latest`, `current`, `3` or `v3` (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let stripped = lower.strip_prefix('v').unwrap_or(&lower);
        match stripped {
            "latest" | "current" => Ok(Self::Latest),
            digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => digits
                .parse()
                .map(Self::Version)
                .map_err(|_| Error::config(format!("version [{s}] is out of range"))),
            _ => Err(Error::config(format!("version [{s}] is malformed"))),
        }
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Version(v) => write!(f, "{}", version_name(*v)),
        }
    }
}

/// Map a selector to an existing committed version
pub fn resolve(layout: &Layout, node_id: NodeId, selector: VersionSelector) -> Result<u32> {
    let latest = latest_version(layout, node_id)?.ok_or_else(|| Error::VersionConflict {
        node_id,
        reason: "node does not have a committed config".to_string(),
    })?;
    match selector {
        VersionSelector::Latest => Ok(latest),
        VersionSelector::Version(v) if layout.version_dir(node_id, v).is_dir() => Ok(v),
        VersionSelector::Version(v) => Err(Error::VersionConflict {
            node_id,
            reason: format!("no config version [{}]", version_name(v)),
        }),
    }
}

/// Version the `active` pointer currently refers to
pub fn active_version(layout: &Layout, node_id: NodeId) -> Result<Option<u32>> {
    match fs::read_link(layout.active_link(node_id)) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|n| crate::layout::parse_version_name(&n.to_string_lossy()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Point `active` at `v<version>`: create the new link beside it, then rename over it
pub fn set_active(layout: &Layout, node_id: NodeId, version: u32) -> Result<()> {
    let link = layout.active_link(node_id);
    let tmp = layout
        .effective_node_dir(node_id)
        .join(format!(".{ACTIVE_LINK}.tmp"));
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(version_name(version), &tmp)?;
    fs::rename(&tmp, &link)?;
    Ok(())
}

/// What happened to one node during activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    Activated(u32),
    Skipped(String),
    Failed(String),
}

/// Per-node outcomes of a bulk activation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub outcomes: Vec<(NodeId, ActivationOutcome)>,
}

impl ActivationReport {
    pub fn activated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ActivationOutcome::Activated(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ActivationOutcome::Failed(_)))
            .count()
    }
}

/// Activate one node and push the bundle to its management address.
///
/// Nodes that were never attached are skipped; a missing version is a
/// [`Error::VersionConflict`] and leaves the pointer untouched.
pub fn activate(
    layout: &Layout,
    node_id: NodeId,
    selector: VersionSelector,
    mgmt_address: Option<&str>,
    distributor: &dyn Distributor,
) -> Result<ActivationOutcome> {
    let Some(address) = mgmt_address else {
        warn!(
            "Node [{}] does not seem to have been attached; attach_mgmt_address is missing; skipping",
            node_id
        );
        return Ok(ActivationOutcome::Skipped(
            "attach_mgmt_address is missing".to_string(),
        ));
    };

    let version = resolve(layout, node_id, selector)?;
    set_active(layout, node_id, version)?;
    info!("Activated version {} of node {}", version_name(version), node_id);
    distributor.mirror_active(&layout.effective_node_dir(node_id), address)?;
    Ok(ActivationOutcome::Activated(version))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Distributor for Recorder {
        fn mirror_configs(&self, _: &std::path::Path, host: &str) -> Result<()> {
            self.0.lock().unwrap().push(format!("configs {host}"));
            Ok(())
        }

        fn mirror_active(&self, _: &std::path::Path, host: &str) -> Result<()> {
            self.0.lock().unwrap().push(format!("active {host}"));
            Ok(())
        }
    }

    fn commit(layout: &Layout, node_id: NodeId, version: u32) {
        fs::create_dir_all(layout.version_dir(node_id, version)).unwrap();
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("latest".parse::<VersionSelector>().unwrap(), VersionSelector::Latest);
        assert_eq!("Current".parse::<VersionSelector>().unwrap(), VersionSelector::Latest);
        assert_eq!("v3".parse::<VersionSelector>().unwrap(), VersionSelector::Version(3));
        assert_eq!("7".parse::<VersionSelector>().unwrap(), VersionSelector::Version(7));
        assert!("v".parse::<VersionSelector>().is_err());
        assert!("newest".parse::<VersionSelector>().is_err());
        assert!("-1".parse::<VersionSelector>().is_err());
    }

    #[test]
    fn test_activate_latest_and_switch() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let recorder = Recorder::default();
        commit(&layout, 11, 1);
        commit(&layout, 11, 2);

        let outcome =
            activate(&layout, 11, VersionSelector::Latest, Some("fe80::b%x"), &recorder).unwrap();
        assert_eq!(outcome, ActivationOutcome::Activated(2));
        assert_eq!(active_version(&layout, 11).unwrap(), Some(2));

        activate(&layout, 11, VersionSelector::Version(1), Some("fe80::b%x"), &recorder).unwrap();
        assert_eq!(active_version(&layout, 11).unwrap(), Some(1));
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_version_keeps_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let recorder = Recorder::default();
        commit(&layout, 11, 1);
        set_active(&layout, 11, 1).unwrap();

        let err = activate(&layout, 11, VersionSelector::Version(2), Some("a"), &recorder)
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { node_id: 11, .. }));
        assert_eq!(active_version(&layout, 11).unwrap(), Some(1));
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unattached_node_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        commit(&layout, 11, 1);
        let outcome =
            activate(&layout, 11, VersionSelector::Latest, None, &Recorder::default()).unwrap();
        assert!(matches!(outcome, ActivationOutcome::Skipped(_)));
        assert_eq!(active_version(&layout, 11).unwrap(), None);
    }

    #[test]
    fn test_no_committed_version() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        assert!(matches!(
            resolve(&layout, 11, VersionSelector::Latest),
            Err(Error::VersionConflict { .. })
        ));
    }
}
