//! Merged (global → site → node) configuration views

use std::collections::BTreeMap;

use serde::Serialize;
use toml::{Table, Value};

use super::{path, ConfigLayer};

/// Flat key/value view of the merged hierarchy; keys are dotted paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FlatConfig(BTreeMap<String, Value>);

impl FlatConfig {
    /// Merge layers from least to most specific; later layers win per key
    pub fn merge<'a>(layers: impl IntoIterator<Item = &'a ConfigLayer>) -> Self {
        let mut merged = BTreeMap::new();
        for layer in layers {
            merged.extend(path::flatten(layer.table()));
        }
        Self(merged)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_integer)
    }

    /// A value that may be written as a single string or a list of strings
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => Some(vec![other.to_string()]),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Nested view of the same data
    pub fn nested(&self) -> Table {
        path::unflatten(&self.0)
    }
}

/// Cached merged view with an explicit dirty flag.
///
/// Writers call [`CachedView::invalidate`]; readers recompute only when dirty.
#[derive(Debug, Clone, Default)]
pub struct CachedView {
    view: FlatConfig,
    dirty: bool,
}

impl CachedView {
    pub fn new() -> Self {
        Self {
            view: FlatConfig::default(),
            dirty: true,
        }
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the cached view, rebuilding it with `build` if dirty
    pub fn get_or_rebuild(&mut self, build: impl FnOnce() -> FlatConfig) -> &FlatConfig {
        if self.dirty {
            self.view = build();
            self.dirty = false;
        }
        &self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(content: &str) -> ConfigLayer {
        let mut l = ConfigLayer::empty("/dev/null");
        for (k, v) in path::flatten(&content.parse::<Table>().unwrap()) {
            l.set(&k, v).unwrap();
        }
        l
    }

    #[test]
    fn test_closest_layer_wins() {
        let global = layer("a = 1\nb = 1\n[x]\ny = 1");
        let site = layer("b = 2\n[x]\nz = 2");
        let node = layer("[x]\ny = 3");
        let merged = FlatConfig::merge([&global, &site, &node]);
        assert_eq!(merged.get_int("a"), Some(1));
        assert_eq!(merged.get_int("b"), Some(2));
        assert_eq!(merged.get_int("x.y"), Some(3));
        assert_eq!(merged.get_int("x.z"), Some(2));
    }

    #[test]
    fn test_str_list_accepts_scalar() {
        let merged = FlatConfig::merge([&layer("k = 'one'\nl = ['a', 'b']")]);
        assert_eq!(merged.get_str_list("k"), Some(vec!["one".to_string()]));
        assert_eq!(merged.get_str_list("l").map(|l| l.len()), Some(2));
        assert_eq!(merged.get_str_list("missing"), None);
    }

    #[test]
    fn test_cached_view_rebuilds_only_when_dirty() {
        let mut cache = CachedView::new();
        let mut builds = 0;
        cache.get_or_rebuild(|| {
            builds += 1;
            FlatConfig::default()
        });
        cache.get_or_rebuild(|| {
            builds += 1;
            FlatConfig::default()
        });
        assert_eq!(builds, 1);
        cache.invalidate();
        cache.get_or_rebuild(|| {
            builds += 1;
            FlatConfig::default()
        });
        assert_eq!(builds, 2);
    }
}
