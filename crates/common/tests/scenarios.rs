//! End-to-end controller scenarios on a temporary configuration root

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use toml::Value;
use wgmesh_common::activation::{active_version, ActivationOutcome};
use wgmesh_common::compiler::EFFECTIVE_CONFIG_FILE;
use wgmesh_common::config::schema::ATTR_MGMT_ADDRESS;
use wgmesh_common::controller::Selection;
use wgmesh_common::exec::Distributor;
use wgmesh_common::versions::list_versions;
use wgmesh_common::{
    ControllerConfig, Controller, EffectiveConfig, Error, KeyGenerator, Layout, Link,
    PromoteOutcome, Scope, VersionSelector,
};

/// Keys derived from a counter so runs are reproducible
#[derive(Default)]
struct CountingKeys(AtomicU32);

impl KeyGenerator for CountingKeys {
    fn private_key(&self) -> Option<String> {
        Some(format!("private-{}", self.0.fetch_add(1, Ordering::SeqCst)))
    }

    fn public_key(&self, private_key: &str) -> Option<String> {
        Some(private_key.replacen("private", "public", 1))
    }

    fn preshared_key(&self) -> Option<String> {
        Some(format!("psk-{}", self.0.fetch_add(1, Ordering::SeqCst)))
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Distributor for Recorder {
    fn mirror_configs(&self, _node_dir: &Path, host: &str) -> wgmesh_common::Result<()> {
        self.0.lock().unwrap().push(format!("configs {host}"));
        Ok(())
    }

    fn mirror_active(&self, _node_dir: &Path, host: &str) -> wgmesh_common::Result<()> {
        self.0.lock().unwrap().push(format!("active {host}"));
        Ok(())
    }
}

fn controller(dir: &TempDir) -> (Controller, Recorder) {
    let recorder = Recorder::default();
    let controller = Controller::open(
        Layout::new(dir.path()),
        ControllerConfig::default(),
        Box::new(CountingKeys::default()),
        Box::new(recorder.clone()),
    )
    .unwrap();
    (controller, recorder)
}

/// Two nodes, 11 and 12, in site `default`
fn two_nodes(dir: &TempDir) -> (Controller, Recorder) {
    let (mut controller, recorder) = controller(dir);
    let store = controller.store_mut();
    store.add_site("default").unwrap();
    assert_eq!(store.add_node("a", "default").unwrap(), 11);
    assert_eq!(store.add_node("b", "default").unwrap(), 12);
    (controller, recorder)
}

fn set_global(controller: &mut Controller, key: &str, value: &str) {
    controller
        .store_mut()
        .set_attr(&Scope::Global, key, Some(Value::String(value.to_string())))
        .unwrap();
}

#[test]
fn nodes_sharing_a_group_get_one_link() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);
    controller.refresh_topology().unwrap();

    let state = controller.topology().state().clone();
    let record = state.link(Link::new(11, 12)).unwrap();
    assert!(record.active);
    assert!(record.wg_active);
    let material = record.material.as_ref().unwrap();
    assert_eq!(material.keys.len(), 2);
    assert!(material.wg_preshared.starts_with("psk-"));
    assert_eq!(state.neighbors_of(11), &[12]);

    let eff11 = EffectiveConfig::build(controller.store_mut(), &state, 11).unwrap();
    let eff12 = EffectiveConfig::build(controller.store_mut(), &state, 12).unwrap();
    assert_eq!(
        eff11.flat().get_str("wg_links.12.wg_peer_public"),
        Some(material.keypair(12).unwrap().public_key.as_str())
    );
    assert_eq!(
        eff12.flat().get_str("wg_links.11.wg_peer_public"),
        Some(material.keypair(11).unwrap().public_key.as_str())
    );
    assert_eq!(
        eff11.flat().get_str("wg_links.12.wg_peer_preshared"),
        eff12.flat().get_str("wg_links.11.wg_peer_preshared"),
    );
}

#[test]
fn loopback_follows_the_configured_base() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);
    set_global(&mut controller, "loopbacknet_ipv4", "192.0.2.0/24");
    controller.refresh_topology().unwrap();

    let state = controller.topology().state().clone();
    let eff = EffectiveConfig::build(controller.store_mut(), &state, 11).unwrap();
    assert_eq!(eff.flat().get_str("bgp_ipv4"), Some("192.0.2.11"));
    assert_eq!(eff.flat().get_str("loopback_ipv4"), Some("192.0.2.11/32"));
}

#[test]
fn identical_content_is_not_committed_again() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);

    for (expected, motd) in [(1, "one"), (2, "two"), (3, "three")] {
        set_global(&mut controller, "motd", motd);
        let report = controller.commit(&[11], false).unwrap();
        assert_eq!(report.outcomes, vec![(11, PromoteOutcome::Committed(expected))]);
    }

    let report = controller.commit(&[11], false).unwrap();
    assert_eq!(report.outcomes, vec![(11, PromoteOutcome::Unchanged)]);
    assert!(report.changed().is_empty());

    let layout = controller.layout().clone();
    assert_eq!(list_versions(&layout, 11).unwrap(), vec![1, 2, 3]);
    assert!(!layout.version_dir(11, 4).exists());
    assert!(!layout.candidate_dir(11).exists());
}

#[test]
fn missing_version_leaves_pointer_alone() {
    let dir = TempDir::new().unwrap();
    let (mut controller, recorder) = two_nodes(&dir);
    controller
        .store_mut()
        .set_attr(
            &Scope::Node(11),
            ATTR_MGMT_ADDRESS,
            Some(Value::String("fe80::b%tlwg_mgmt".into())),
        )
        .unwrap();
    controller.commit(&[11], false).unwrap();
    let layout = controller.layout().clone();
    assert_eq!(active_version(&layout, 11).unwrap(), None);

    let report = controller.activate(&[11], "v2".parse().unwrap());
    assert_eq!(report.failed(), 1);
    assert!(matches!(report.outcomes[0].1, ActivationOutcome::Failed(_)));
    assert_eq!(active_version(&layout, 11).unwrap(), None);
    assert!(!recorder.calls().iter().any(|c| c.starts_with("active")));

    let report = controller.activate(&[11], VersionSelector::Latest);
    assert_eq!(report.outcomes, vec![(11, ActivationOutcome::Activated(1))]);
    assert_eq!(active_version(&layout, 11).unwrap(), Some(1));
}

#[test]
fn refresh_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);
    assert!(controller.refresh_topology().unwrap());
    let first = fs::read_to_string(controller.layout().generated_config()).unwrap();

    assert!(!controller.refresh_topology().unwrap());
    let second = fs::read_to_string(controller.layout().generated_config()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn commit_twice_is_unchanged_and_versions_grow() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);

    let first = controller.commit(&[11, 12], false).unwrap();
    assert_eq!(first.changed(), vec![11, 12]);
    let second = controller.commit(&[11, 12], false).unwrap();
    assert!(second.changed().is_empty());
    assert!(controller.changed_nodes().unwrap().is_empty());

    set_global(&mut controller, "motd", "changed");
    assert_eq!(controller.changed_nodes().unwrap(), vec![11, 12]);
    // Dry runs never create versions
    assert_eq!(list_versions(controller.layout(), 11).unwrap(), vec![1]);

    let third = controller.commit(&[11], false).unwrap();
    assert_eq!(third.outcomes, vec![(11, PromoteOutcome::Committed(2))]);

    let yaml = fs::read_to_string(
        controller.layout().version_dir(11, 2).join(EFFECTIVE_CONFIG_FILE),
    )
    .unwrap();
    assert!(yaml.contains("changed"));
}

#[test]
fn removed_node_deactivates_its_links() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);
    controller.refresh_topology().unwrap();
    controller.store_mut().remove_node(12).unwrap();
    controller.refresh_topology().unwrap();

    let record = controller.topology().state().link(Link::new(11, 12)).unwrap();
    assert!(!record.active);
    assert!(record.material.is_some());

    // node 11 no longer has any peer in its bundle
    let state = controller.topology().state().clone();
    let eff = EffectiveConfig::build(controller.store_mut(), &state, 11).unwrap();
    assert!(eff.wg_peers().is_empty());
}

#[test]
fn separate_groups_are_not_linked() {
    let dir = TempDir::new().unwrap();
    let (mut controller, _) = two_nodes(&dir);
    controller
        .store_mut()
        .set_attr(
            &Scope::Node(12),
            "groups",
            Some(Value::Array(vec![Value::String("edge".into())])),
        )
        .unwrap();
    controller.refresh_topology().unwrap();
    let record = controller.topology().state().link(Link::new(11, 12)).unwrap();
    assert!(!record.active);
    assert!(record.material.is_none());
}

#[test]
fn only_attached_nodes_are_mirrored() {
    let dir = TempDir::new().unwrap();
    let (mut controller, recorder) = two_nodes(&dir);
    controller
        .store_mut()
        .set_attr(
            &Scope::Node(12),
            ATTR_MGMT_ADDRESS,
            Some(Value::String("fe80::c%tlwg_mgmt".into())),
        )
        .unwrap();

    let nodes = controller.select(&Selection::Site("default".into())).unwrap();
    controller.commit(&nodes, false).unwrap();
    assert_eq!(recorder.calls(), vec!["configs fe80::c%tlwg_mgmt".to_string()]);

    let report = controller.activate(&nodes, VersionSelector::Latest);
    assert_eq!(report.activated(), 1);
    assert!(matches!(report.outcomes[0].1, ActivationOutcome::Skipped(_)));
    assert_eq!(recorder.calls().last().map(String::as_str), Some("active fe80::c%tlwg_mgmt"));
}

#[test]
fn node_references_resolve() {
    let dir = TempDir::new().unwrap();
    let (controller, _) = two_nodes(&dir);
    assert_eq!(controller.select(&Selection::Node("b.default".into())).unwrap(), vec![12]);
    assert_eq!(controller.select(&Selection::Node("11".into())).unwrap(), vec![11]);
    assert_eq!(controller.select(&Selection::All).unwrap(), vec![11, 12]);
    assert!(matches!(
        controller.select(&Selection::Node("c.default".into())),
        Err(Error::NotFound { .. })
    ));
}
