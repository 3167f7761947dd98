use keel_core::{ClusterSpec, HostSpec, Kind, NodeGroupSpec, NodeSpec, StorageConfig};
use keel_registry::Registry;

#[test]
fn scope_roots_do_not_bleed_into_each_other() {
    let reg = Registry::new(&StorageConfig::default()).unwrap();
    let nodes = reg.descriptor::<NodeSpec>();
    let in_ns2 = nodes.key_for("ns2", "n1").unwrap();
    assert!(!in_ns2.starts_with(&nodes.layout.range_prefix("ns")));
    assert!(in_ns2.starts_with(&nodes.layout.range_prefix("ns2")));
    assert!(in_ns2.starts_with(&nodes.layout.range_prefix("")));
}

#[test]
fn type_roots_are_disjoint() {
    let reg = Registry::new(&StorageConfig::default()).unwrap();
    let node = reg.descriptor::<NodeSpec>().key_for("prod", "a").unwrap();
    let group = reg.descriptor::<NodeGroupSpec>().key_for("prod", "a").unwrap();
    assert_ne!(node, group);
    assert!(!group.starts_with(&reg.layout(Kind::Node).range_prefix("")));
}

#[test]
fn every_kind_has_a_descriptor() {
    let reg = Registry::new(&StorageConfig::default()).unwrap();
    let kinds: Vec<Kind> = reg.layouts().into_iter().map(|(k, _)| k).collect();
    for k in Kind::ALL {
        assert!(kinds.contains(&k));
    }
    assert_eq!(reg.descriptor::<ClusterSpec>().kind(), Kind::Cluster);
    assert_eq!(reg.descriptor::<HostSpec>().key_root("prod"), "/keel/hosts");
}
