//! Numbered, immutable versions of a node's bundle
//!
//! `new/` is compared against the highest `v<N>`; only a real change
//! becomes `v<N+1>`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::compiler::remove_dir_if_exists;
use crate::layout::{parse_version_name, Layout};
use crate::{Error, NodeId, Result};

/// Result of promoting a candidate bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Identical to the latest version; candidate discarded
    Unchanged,
    /// Committed as this version
    Committed(u32),
    /// Would have been committed; dry run discarded it
    WouldCommit,
}

impl PromoteOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, PromoteOutcome::Unchanged)
    }
}

/// Committed version numbers of a node, ascending
pub fn list_versions(layout: &Layout, node_id: NodeId) -> Result<Vec<u32>> {
    let dir = layout.effective_node_dir(node_id);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        // file_type does not follow symlinks, so `active` is skipped
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(v) = parse_version_name(&entry.file_name().to_string_lossy()) {
            versions.push(v);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

pub fn latest_version(layout: &Layout, node_id: NodeId) -> Result<Option<u32>> {
    Ok(list_versions(layout, node_id)?.last().copied())
}

/// Relative paths of all regular files below `dir`
fn relative_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(dir) {
                files.push(rel.to_path_buf());
            }
        }
    }
    Ok(files)
}

/// Equal iff both trees hold the same relative file names with byte-identical contents
pub fn compare_directories(a: &Path, b: &Path) -> Result<bool> {
    let files_a = relative_files(a)?;
    let files_b = relative_files(b)?;
    if files_a != files_b {
        return Ok(false);
    }
    for rel in &files_a {
        let (pa, pb) = (a.join(rel), b.join(rel));
        if fs::metadata(&pa)?.len() != fs::metadata(&pb)?.len() {
            return Ok(false);
        }
        if fs::read(&pa)? != fs::read(&pb)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Turn `new/` into the next version if it differs from the latest one
pub fn promote(layout: &Layout, node_id: NodeId, dry_run: bool) -> Result<PromoteOutcome> {
    let candidate = layout.candidate_dir(node_id);
    if !candidate.is_dir() {
        return Err(Error::not_found("candidate bundle", candidate.display()));
    }

    let latest = latest_version(layout, node_id)?;
    if let Some(latest) = latest {
        if compare_directories(&layout.version_dir(node_id, latest), &candidate)? {
            debug!("Config for node {} did not change", node_id);
            remove_dir_if_exists(&candidate)?;
            return Ok(PromoteOutcome::Unchanged);
        }
    }

    if dry_run {
        debug!("Config for node {} did change", node_id);
        remove_dir_if_exists(&candidate)?;
        return Ok(PromoteOutcome::WouldCommit);
    }

    let next = latest.map_or(1, |v| v + 1);
    fs::rename(&candidate, layout.version_dir(node_id, next))?;
    debug!("Config for node {} is saved as version [v{}]", node_id, next);
    Ok(PromoteOutcome::Committed(next))
}
