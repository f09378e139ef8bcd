//! One TOML configuration file with change tracking

use std::fs;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::{debug, warn};

use super::path;
use crate::{Error, Result};

/// A single configuration layer backed by a TOML file.
///
/// Writes only mark the layer dirty; `save` persists it when something
/// actually changed.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    path: PathBuf,
    table: Table,
    dirty: bool,
}

impl ConfigLayer {
    /// Load a layer; a missing file yields an empty layer
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = match fs::read_to_string(&path) {
            Ok(content) => content.parse::<Table>().map_err(|e| Error::TomlParse {
                path: path.display().to_string(),
                source: e,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found; using defaults", path);
                Table::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            table,
            dirty: false,
        })
    }

    /// An empty, unsaved layer at the given path
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: Table::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        path::get(&self.table, key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<bool> {
        let changed = path::set(&mut self.table, key, value.into())?;
        self.dirty |= changed;
        Ok(changed)
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) -> Result<bool> {
        let changed = path::set_default(&mut self.table, key, value.into())?;
        self.dirty |= changed;
        Ok(changed)
    }

    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let changed = path::remove(&mut self.table, key)?;
        self.dirty |= changed;
        Ok(changed)
    }

    /// Persist pending changes. Returns whether the file was written.
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            debug!("Nothing changed; not saving {:?}", self.path);
            return Ok(false);
        }
        let content = toml::to_string_pretty(&self.table)?;
        write_atomic(&self.path, content.as_bytes())?;
        debug!("Saved config file {:?}", self.path);
        self.dirty = false;
        Ok(true)
    }
}

/// Write a file via a sibling temp file and `rename(2)`
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ConfigLayer::load(dir.path().join("config.toml")).unwrap();
        assert!(layer.table().is_empty());
        assert!(!layer.is_dirty());
    }

    #[test]
    fn test_save_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut layer = ConfigLayer::load(&path).unwrap();
        assert!(!layer.save().unwrap());
        assert!(!path.exists());

        layer.set("controller_hostname", "ctl.example.net").unwrap();
        assert!(layer.save().unwrap());
        assert!(!layer.save().unwrap());

        let reloaded = ConfigLayer::load(&path).unwrap();
        assert_eq!(
            reloaded.get("controller_hostname").and_then(Value::as_str),
            Some("ctl.example.net")
        );
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "node_id = = 3").unwrap();
        let err = ConfigLayer::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
