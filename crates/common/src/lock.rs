//! Per-node advisory lock serializing compile, promote and activate

use std::fs::{self, File, OpenOptions};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::layout::Layout;
use crate::{Error, NodeId, Result};

/// Exclusive `flock(2)` on `effective/node_<id>.lock`; released on drop
#[derive(Debug)]
pub struct NodeLock {
    node_id: NodeId,
    _flock: Flock<File>,
}

impl NodeLock {
    /// Block until the lock for `node_id` is held
    pub fn acquire(layout: &Layout, node_id: NodeId) -> Result<Self> {
        let file = open_lock_file(layout, node_id)?;
        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::Io(std::io::Error::from_raw_os_error(errno as i32))
        })?;
        trace!("Locked node {}", node_id);
        Ok(Self {
            node_id,
            _flock: flock,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

fn open_lock_file(layout: &Layout, node_id: NodeId) -> Result<File> {
    let path = layout.node_lock(node_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_free(layout: &Layout, node_id: NodeId) -> bool {
        let file = open_lock_file(layout, node_id).unwrap();
        Flock::lock(file, FlockArg::LockExclusiveNonblock).is_ok()
    }

    #[test]
    fn test_lock_is_exclusive_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let held = NodeLock::acquire(&layout, 11).unwrap();
        assert_eq!(held.node_id(), 11);
        assert!(!is_free(&layout, 11));
        // Other nodes do not contend
        assert!(is_free(&layout, 12));
        drop(held);
        assert!(is_free(&layout, 11));
    }
}
