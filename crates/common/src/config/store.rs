//! The configuration hierarchy on disk: global, site and node layers

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;

use toml::Value;
use tracing::{debug, info};

use super::schema::{
    GlobalSettings, NetworkPlan, NodeIdentity, ATTR_CONFIG_FILENAME, ATTR_NODE_FULLNAME,
    ATTR_NODE_ID, ATTR_NODE_NAME, ATTR_SITE_NAME,
};
use super::{write_atomic, CachedView, ConfigLayer, FlatConfig};
use crate::layout::{is_numeric, Layout, CONFIG_FILE, NODE_DIR_PREFIX, SITE_DIR_PREFIX};
use crate::{Error, NodeId, Result};

/// Smallest node id handed out; lower ids are reserved
pub const FIRST_NODE_ID: NodeId = 11;

/// Which layer a write goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Site(String),
    Node(NodeId),
}

/// One node as known to the store
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub name: String,
    pub site: String,
    layer: ConfigLayer,
}

impl NodeEntry {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.site)
    }

    pub fn layer(&self) -> &ConfigLayer {
        &self.layer
    }
}

/// Loaded configuration tree with cached merged views.
///
/// Global writes invalidate every view, site writes the site and its nodes,
/// node writes only that node.
#[derive(Debug)]
pub struct ConfigStore {
    layout: Layout,
    global: ConfigLayer,
    sites: BTreeMap<String, ConfigLayer>,
    nodes: BTreeMap<NodeId, NodeEntry>,
    site_views: HashMap<String, CachedView>,
    node_views: HashMap<NodeId, CachedView>,
}

impl ConfigStore {
    /// Load every layer below the configuration root
    pub fn open(layout: Layout) -> Result<Self> {
        let global = ConfigLayer::load(layout.global_config())?;
        let mut sites = BTreeMap::new();
        let mut nodes = BTreeMap::new();

        for site in list_prefixed(layout.root(), SITE_DIR_PREFIX)? {
            let site_dir = layout.site_dir(&site);
            sites.insert(site.clone(), ConfigLayer::load(site_dir.join(CONFIG_FILE))?);

            for node in list_prefixed(&site_dir, NODE_DIR_PREFIX)? {
                let layer = ConfigLayer::load(layout.node_dir(&site, &node).join(CONFIG_FILE))?;
                let node_id = layer
                    .get(ATTR_NODE_ID)
                    .and_then(Value::as_integer)
                    .and_then(|n| NodeId::try_from(n).ok())
                    .ok_or_else(|| {
                        Error::CorruptState(format!(
                            "{:?} has no valid {ATTR_NODE_ID}",
                            layer.path()
                        ))
                    })?;
                if node_id < FIRST_NODE_ID {
                    return Err(Error::CorruptState(format!(
                        "{:?} has {ATTR_NODE_ID} {node_id}, ids start at {FIRST_NODE_ID}",
                        layer.path()
                    )));
                }
                let entry = NodeEntry {
                    node_id,
                    name: node,
                    site: site.clone(),
                    layer,
                };
                if let Some(existing) = nodes.insert(node_id, entry) {
                    return Err(Error::CorruptState(format!(
                        "node id {node_id} is used twice (also by {})",
                        existing.full_name()
                    )));
                }
            }
        }

        debug!("Loaded {} site(s) and {} node(s)", sites.len(), nodes.len());
        Ok(Self {
            layout,
            global,
            sites,
            nodes,
            site_views: HashMap::new(),
            node_views: HashMap::new(),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn global_layer(&self) -> &ConfigLayer {
        &self.global
    }

    pub fn site_layer(&self, site: &str) -> Result<&ConfigLayer> {
        self.sites
            .get(site)
            .ok_or_else(|| Error::not_found("site", site))
    }

    pub fn site_names(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn node(&self, node_id: NodeId) -> Result<&NodeEntry> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| Error::not_found("node", node_id))
    }

    /// Node ids of one site, ascending
    pub fn site_node_ids(&self, site: &str) -> Result<Vec<NodeId>> {
        self.site_layer(site)?;
        Ok(self
            .nodes
            .values()
            .filter(|n| n.site == site)
            .map(|n| n.node_id)
            .collect())
    }

    /// Resolves `<name>.<site>` or a numeric node id
    pub fn resolve_node_ref(&self, reference: &str) -> Result<NodeId> {
        if is_numeric(reference) {
            let id: NodeId = reference
                .parse()
                .map_err(|_| Error::not_found("node", reference))?;
            return self.node(id).map(|n| n.node_id);
        }
        let (name, site) = reference.split_once('.').ok_or_else(|| {
            Error::InvalidName(format!(
                "node reference [{reference}] must be <node>.<site> or a node id"
            ))
        })?;
        self.nodes
            .values()
            .find(|n| n.name == name && n.site == site)
            .map(|n| n.node_id)
            .ok_or_else(|| Error::not_found("node", reference))
    }

    /// Merged global view
    pub fn global_view(&self) -> FlatConfig {
        let mut view = FlatConfig::merge([&self.global]);
        view.insert(
            ATTR_CONFIG_FILENAME,
            self.global.path().display().to_string(),
        );
        view
    }

    /// Merged global + site view
    pub fn site_view(&mut self, site: &str) -> Result<FlatConfig> {
        let layer = self
            .sites
            .get(site)
            .ok_or_else(|| Error::not_found("site", site))?;
        let global = &self.global;
        let cache = self
            .site_views
            .entry(site.to_string())
            .or_insert_with(CachedView::new);
        let view = cache.get_or_rebuild(|| {
            let mut view = FlatConfig::merge([global, layer]);
            view.insert(ATTR_SITE_NAME, site.to_string());
            view.insert(ATTR_CONFIG_FILENAME, layer.path().display().to_string());
            view
        });
        Ok(view.clone())
    }

    /// Merged global + site + node view, including the ephemeral name attributes
    pub fn node_view(&mut self, node_id: NodeId) -> Result<FlatConfig> {
        let entry = self
            .nodes
            .get(&node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        let site_layer = self
            .sites
            .get(&entry.site)
            .ok_or_else(|| Error::CorruptState(format!("site {} vanished", entry.site)))?;
        let global = &self.global;
        let cache = self
            .node_views
            .entry(node_id)
            .or_insert_with(CachedView::new);
        let view = cache.get_or_rebuild(|| {
            let mut view = FlatConfig::merge([global, site_layer, &entry.layer]);
            view.insert(ATTR_NODE_NAME, entry.name.clone());
            view.insert(ATTR_SITE_NAME, entry.site.clone());
            view.insert(ATTR_NODE_FULLNAME, entry.full_name());
            view.insert(
                ATTR_CONFIG_FILENAME,
                entry.layer.path().display().to_string(),
            );
            view
        });
        Ok(view.clone())
    }

    pub fn global_settings(&self) -> Result<GlobalSettings> {
        GlobalSettings::from_view(&self.global_view())
    }

    pub fn network_plan(&mut self, node_id: NodeId) -> Result<NetworkPlan> {
        NetworkPlan::from_view(&self.node_view(node_id)?)
    }

    pub fn identity(&mut self, node_id: NodeId) -> Result<NodeIdentity> {
        let view = self.node_view(node_id)?;
        let entry = self.node(node_id)?;
        Ok(NodeIdentity {
            node_id,
            name: entry.name.clone(),
            site: entry.site.clone(),
            groups: NodeIdentity::groups_from_view(&view),
        })
    }

    /// Identities of all nodes, ordered by id
    pub fn identities(&mut self) -> Result<Vec<NodeIdentity>> {
        self.node_ids()
            .into_iter()
            .map(|id| self.identity(id))
            .collect()
    }

    pub fn add_site(&mut self, site: &str) -> Result<()> {
        validate_name(site)?;
        if self.sites.contains_key(site) {
            return Err(Error::AlreadyExists {
                kind: "site".into(),
                id: site.into(),
            });
        }
        let dir = self.layout.site_dir(site);
        fs::create_dir_all(&dir)?;
        let layer = ConfigLayer::empty(dir.join(CONFIG_FILE));
        write_atomic(layer.path(), b"")?;
        self.sites.insert(site.to_string(), layer);
        info!("Created site {}", site);
        Ok(())
    }

    /// Create a node with the smallest free id ≥ [`FIRST_NODE_ID`]
    pub fn add_node(&mut self, name: &str, site: &str) -> Result<NodeId> {
        validate_name(name)?;
        self.site_layer(site)?;
        if self.nodes.values().any(|n| n.name == name && n.site == site) {
            return Err(Error::AlreadyExists {
                kind: "node".into(),
                id: format!("{name}.{site}"),
            });
        }

        let node_id = (FIRST_NODE_ID..)
            .find(|id| !self.nodes.contains_key(id))
            .ok_or_else(|| Error::config("node id space exhausted"))?;

        let dir = self.layout.node_dir(site, name);
        fs::create_dir_all(&dir)?;
        let mut layer = ConfigLayer::empty(dir.join(CONFIG_FILE));
        layer.set(ATTR_NODE_ID, i64::from(node_id))?;
        layer.save()?;

        self.nodes.insert(
            node_id,
            NodeEntry {
                node_id,
                name: name.to_string(),
                site: site.to_string(),
                layer,
            },
        );
        info!("Created node {}.{} with id {}", name, site, node_id);
        Ok(node_id)
    }

    /// Remove an empty site
    pub fn remove_site(&mut self, site: &str) -> Result<()> {
        let node_ids = self.site_node_ids(site)?;
        if !node_ids.is_empty() {
            return Err(Error::config(format!(
                "site {site} still has {} node(s)",
                node_ids.len()
            )));
        }
        fs::remove_dir_all(self.layout.site_dir(site))?;
        self.sites.remove(site);
        self.site_views.remove(site);
        info!("Removed site {}", site);
        Ok(())
    }

    /// Remove a node's layer directory; its effective versions are left in place
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<()> {
        let entry = self
            .nodes
            .remove(&node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        fs::remove_dir_all(self.layout.node_dir(&entry.site, &entry.name))?;
        self.node_views.remove(&node_id);
        info!("Removed node {} ({})", entry.full_name(), node_id);
        Ok(())
    }

    /// Set (`Some`) or delete (`None`) an attribute and persist the layer.
    /// Returns whether anything changed.
    pub fn set_attr(&mut self, scope: &Scope, key: &str, value: Option<Value>) -> Result<bool> {
        if matches!(scope, Scope::Node(_)) && key == ATTR_NODE_ID {
            return Err(Error::config("node_id is assigned on creation and cannot be changed"));
        }
        let layer = self.layer_mut(scope)?;
        let changed = match value {
            Some(v) => layer.set(key, v)?,
            None => layer.remove(key)?,
        };
        layer.save()?;
        if changed {
            self.invalidate(scope);
        }
        Ok(changed)
    }

    /// Apply several attribute writes to one node layer and save once
    pub fn update_node<I>(&mut self, node_id: NodeId, entries: I) -> Result<bool>
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        let scope = Scope::Node(node_id);
        let layer = self.layer_mut(&scope)?;
        let mut changed = false;
        for (key, value) in entries {
            changed |= match value {
                Some(v) => layer.set(&key, v)?,
                None => layer.remove(&key)?,
            };
        }
        layer.save()?;
        if changed {
            self.invalidate(&scope);
        }
        Ok(changed)
    }

    /// Fill in global values that are still unset
    pub fn ensure_global_defaults<I>(&mut self, defaults: I) -> Result<bool>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut changed = false;
        for (key, value) in defaults {
            changed |= self.global.set_default(&key, value)?;
        }
        self.global.save()?;
        if changed {
            self.invalidate(&Scope::Global);
        }
        Ok(changed)
    }

    fn layer_mut(&mut self, scope: &Scope) -> Result<&mut ConfigLayer> {
        match scope {
            Scope::Global => Ok(&mut self.global),
            Scope::Site(site) => self
                .sites
                .get_mut(site)
                .ok_or_else(|| Error::not_found("site", site)),
            Scope::Node(id) => self
                .nodes
                .get_mut(id)
                .map(|n| &mut n.layer)
                .ok_or_else(|| Error::not_found("node", id)),
        }
    }

    fn invalidate(&mut self, scope: &Scope) {
        match scope {
            Scope::Global => {
                self.site_views.values_mut().for_each(CachedView::invalidate);
                self.node_views.values_mut().for_each(CachedView::invalidate);
            }
            Scope::Site(site) => {
                if let Some(view) = self.site_views.get_mut(site) {
                    view.invalidate();
                }
                let ids: BTreeSet<NodeId> = self
                    .nodes
                    .values()
                    .filter(|n| &n.site == site)
                    .map(|n| n.node_id)
                    .collect();
                for id in ids {
                    if let Some(view) = self.node_views.get_mut(&id) {
                        view.invalidate();
                    }
                }
            }
            Scope::Node(id) => {
                if let Some(view) = self.node_views.get_mut(id) {
                    view.invalidate();
                }
            }
        }
    }
}

/// Site and node names: non-empty, not purely numeric, no path or reference separators
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name must not be empty".into()));
    }
    if is_numeric(name) {
        return Err(Error::InvalidName(format!(
            "[{name}] is purely numeric; numbers are reserved for node ids"
        )));
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '/' || c.is_whitespace())
    {
        return Err(Error::InvalidName(format!(
            "[{name}] must not contain '.', '/' or whitespace"
        )));
    }
    Ok(())
}

/// Names of subdirectories carrying the given prefix, sorted
fn list_prefixed(dir: &std::path::Path, prefix: &str) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some(name) = file_name.strip_prefix(prefix) {
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(Layout::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_node_ids_fill_gaps_from_eleven() {
        let (_dir, mut store) = store();
        store.add_site("berlin").unwrap();
        assert_eq!(store.add_node("a", "berlin").unwrap(), 11);
        assert_eq!(store.add_node("b", "berlin").unwrap(), 12);
        assert_eq!(store.add_node("c", "berlin").unwrap(), 13);
        store.remove_node(12).unwrap();
        assert_eq!(store.add_node("d", "berlin").unwrap(), 12);
    }

    #[test]
    fn test_reload_and_resolve() {
        let (dir, mut store) = store();
        store.add_site("berlin").unwrap();
        store.add_node("gw", "berlin").unwrap();

        let mut reloaded = ConfigStore::open(Layout::new(dir.path())).unwrap();
        assert_eq!(reloaded.resolve_node_ref("gw.berlin").unwrap(), 11);
        assert_eq!(reloaded.resolve_node_ref("11").unwrap(), 11);
        assert!(reloaded.resolve_node_ref("12").is_err());
        assert!(reloaded.resolve_node_ref("gw").is_err());
        let view = reloaded.node_view(11).unwrap();
        assert_eq!(view.get_str(ATTR_NODE_FULLNAME), Some("gw.berlin"));
    }

    #[test]
    fn test_names_are_validated() {
        let (_dir, mut store) = store();
        assert!(matches!(store.add_site("42"), Err(Error::InvalidName(_))));
        assert!(matches!(store.add_site("a.b"), Err(Error::InvalidName(_))));
        store.add_site("x").unwrap();
        assert!(matches!(
            store.add_site("x"),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(store.add_node("n", "missing").is_err());
    }

    #[test]
    fn test_site_write_invalidates_node_view() {
        let (_dir, mut store) = store();
        store.add_site("s").unwrap();
        let id = store.add_node("n", "s").unwrap();
        assert!(store.node_view(id).unwrap().get("groups").is_none());

        store
            .set_attr(
                &Scope::Site("s".into()),
                "groups",
                Some(Value::Array(vec![Value::String("core".into())])),
            )
            .unwrap();
        assert_eq!(
            store.identity(id).unwrap().groups,
            BTreeSet::from(["core".to_string()])
        );

        store
            .set_attr(&Scope::Global, "bgp_as_base", Some(Value::Integer(64512)))
            .unwrap();
        assert_eq!(store.network_plan(id).unwrap().bgp_as_base, 64512);
    }

    #[test]
    fn test_duplicate_node_id_is_corrupt() {
        let (dir, mut store) = store();
        store.add_site("s").unwrap();
        store.add_node("a", "s").unwrap();
        let b = dir.path().join("site_s/node_b");
        fs::create_dir_all(&b).unwrap();
        fs::write(b.join("config.toml"), "node_id = 11\n").unwrap();
        assert!(matches!(
            ConfigStore::open(Layout::new(dir.path())),
            Err(Error::CorruptState(_))
        ));
    }

    #[test]
    fn test_reserved_node_id_is_corrupt() {
        let (dir, mut store) = store();
        store.add_site("s").unwrap();
        let node = dir.path().join("site_s/node_a");
        fs::create_dir_all(&node).unwrap();
        for id in [0, 10] {
            fs::write(node.join("config.toml"), format!("node_id = {id}\n")).unwrap();
            assert!(matches!(
                ConfigStore::open(Layout::new(dir.path())),
                Err(Error::CorruptState(_))
            ));
        }
        fs::write(node.join("config.toml"), "node_id = 11\n").unwrap();
        assert!(ConfigStore::open(Layout::new(dir.path())).is_ok());
    }

    #[test]
    fn test_remove_site_requires_empty() {
        let (_dir, mut store) = store();
        store.add_site("s").unwrap();
        let id = store.add_node("a", "s").unwrap();
        assert!(store.remove_site("s").is_err());
        store.remove_node(id).unwrap();
        store.remove_site("s").unwrap();
        assert_eq!(store.site_names().count(), 0);
    }

    #[test]
    fn test_node_id_is_not_settable() {
        let (_dir, mut store) = store();
        store.add_site("s").unwrap();
        let id = store.add_node("a", "s").unwrap();
        assert!(store
            .set_attr(&Scope::Node(id), "node_id", Some(Value::Integer(99)))
            .is_err());
    }
}
