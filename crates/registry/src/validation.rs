//! Per-kind validation. Every function returns the full set of field errors
//! rather than stopping at the first.

use once_cell::sync::Lazy;
use regex::Regex;

use keel_core::validation::{
    is_dns1123_subdomain, is_qualified_name, validate_object_meta, validate_object_meta_update,
};
use keel_core::{
    Cluster, FieldError, FieldErrors, FieldPath, Host, Node, NodeGroup, NodeType, Object, Spec,
};

static KUBERNETES_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v?\d+\.\d+(\.\d+)?$").expect("static regex"));

fn meta<S: Spec>(obj: &Object<S>, namespaced: bool) -> FieldErrors {
    validate_object_meta(&obj.metadata, namespaced, is_dns1123_subdomain, &FieldPath::new("metadata"))
}

fn meta_update<S: Spec>(new: &Object<S>, old: &Object<S>) -> FieldErrors {
    validate_object_meta_update(&new.metadata, &old.metadata, &FieldPath::new("metadata"))
}

/// Metadata checks shared by every status write: identity is fixed and the
/// rest of the metadata must still pass the create rules.
fn status_meta<S: Spec>(new: &Object<S>, old: &Object<S>) -> FieldErrors {
    let mut errs = meta_update(new, old);
    errs.extend(meta(new, !new.metadata.namespace.is_empty()));
    errs
}

fn subdomain_ref(errs: &mut FieldErrors, path: &FieldPath, value: &str) {
    for msg in is_dns1123_subdomain(value) {
        errs.push(FieldError::invalid(path, value, msg));
    }
}

fn required_ref(errs: &mut FieldErrors, path: &FieldPath, value: &str) {
    if value.is_empty() {
        errs.push(FieldError::required(path, ""));
    } else {
        subdomain_ref(errs, path, value);
    }
}

fn immutable(errs: &mut FieldErrors, path: &FieldPath, new: &str, old: &str) {
    if new != old {
        errs.push(FieldError::invalid(path, new, "field is immutable"));
    }
}

// ---- Cluster ----

pub fn validate_cluster(obj: &Cluster, namespaced: bool) -> FieldErrors {
    let mut errs = meta(obj, namespaced);
    let spec = FieldPath::new("spec");
    let version = &obj.spec.kubernetes_version;
    if !version.is_empty() && !KUBERNETES_VERSION.is_match(version) {
        errs.push(FieldError::invalid(&spec.child("kubernetesVersion"), version, "must look like 1.27 or v1.27.3"));
    }
    if let Some(group) = &obj.spec.master_node_group {
        subdomain_ref(&mut errs, &spec.child("masterNodeGroup"), group);
    }
    errs
}

pub fn validate_cluster_update(new: &Cluster, old: &Cluster) -> FieldErrors {
    let mut errs = meta_update(new, old);
    errs.extend(validate_cluster(new, !new.metadata.namespace.is_empty()));
    errs
}

// ---- Host ----

pub fn validate_host(obj: &Host, namespaced: bool) -> FieldErrors {
    let mut errs = meta(obj, namespaced);
    let spec = FieldPath::new("spec");
    if obj.spec.address.trim().is_empty() {
        errs.push(FieldError::required(&spec.child("address"), "a reachable address is required"));
    }
    let capacity = spec.child("capacity");
    for (k, v) in &obj.spec.capacity {
        for msg in is_qualified_name(k) {
            errs.push(FieldError::invalid(&capacity, k, msg));
        }
        if v.is_empty() {
            errs.push(FieldError::required(&capacity.key(k), ""));
        }
    }
    errs
}

pub fn validate_host_update(new: &Host, old: &Host) -> FieldErrors {
    let mut errs = meta_update(new, old);
    errs.extend(validate_host(new, false));
    errs
}

// ---- NodeGroup ----

pub fn validate_node_group(obj: &NodeGroup, namespaced: bool) -> FieldErrors {
    let mut errs = meta(obj, namespaced);
    let spec = FieldPath::new("spec");
    required_ref(&mut errs, &spec.child("clusterName"), &obj.spec.cluster_name);
    if obj.spec.node_type == NodeType::Master && obj.spec.replicas == 0 {
        errs.push(FieldError::invalid(&spec.child("replicas"), "0", "a master node group needs at least one replica"));
    }
    errs
}

pub fn validate_node_group_update(new: &NodeGroup, old: &NodeGroup) -> FieldErrors {
    let mut errs = meta_update(new, old);
    errs.extend(validate_node_group(new, !new.metadata.namespace.is_empty()));
    let spec = FieldPath::new("spec");
    immutable(&mut errs, &spec.child("clusterName"), &new.spec.cluster_name, &old.spec.cluster_name);
    if new.spec.node_type != old.spec.node_type {
        errs.push(FieldError::invalid(&spec.child("nodeType"), &format!("{:?}", new.spec.node_type), "field is immutable"));
    }
    errs
}

pub fn validate_node_group_status(new: &NodeGroup, old: &NodeGroup) -> FieldErrors {
    let mut errs = status_meta(new, old);
    let nodes = FieldPath::new("status").child("nodes");
    for (i, n) in new.status.nodes.iter().enumerate() {
        subdomain_ref(&mut errs, &nodes.index(i), n);
        if new.status.nodes[..i].contains(n) {
            errs.push(FieldError::duplicate(&nodes.index(i), n));
        }
    }
    errs
}

// ---- Node ----

pub fn validate_node(obj: &Node, namespaced: bool) -> FieldErrors {
    let mut errs = meta(obj, namespaced);
    let spec = FieldPath::new("spec");
    required_ref(&mut errs, &spec.child("nodeGroupName"), &obj.spec.node_group_name);
    if let Some(host) = &obj.spec.host_name {
        subdomain_ref(&mut errs, &spec.child("hostName"), host);
    }
    errs
}

pub fn validate_node_update(new: &Node, old: &Node) -> FieldErrors {
    let mut errs = meta_update(new, old);
    errs.extend(validate_node(new, !new.metadata.namespace.is_empty()));
    immutable(
        &mut errs,
        &FieldPath::new("spec").child("nodeGroupName"),
        &new.spec.node_group_name,
        &old.spec.node_group_name,
    );
    errs
}

/// Status validation for kinds without status-specific rules.
pub fn validate_status_update<S: Spec>(new: &Object<S>, old: &Object<S>) -> FieldErrors {
    status_meta(new, old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ClusterSpec, HostSpec, NodeGroupSpec, NodeSpec};

    #[test]
    fn cluster_version_format() {
        let mut c = Cluster::new("prod", "east", ClusterSpec { kubernetes_version: "v1.27.3".into(), master_node_group: None });
        assert!(validate_cluster(&c, true).is_empty());
        c.spec.kubernetes_version = "latest".into();
        assert!(validate_cluster(&c, true).mentions("spec.kubernetesVersion"));
    }

    #[test]
    fn host_requires_address_and_no_namespace() {
        let h = Host::new("prod", "h1", HostSpec::default());
        let errs = validate_host(&h, false);
        assert!(errs.mentions("spec.address"));
        assert!(errs.mentions("metadata.namespace"));
    }

    #[test]
    fn node_group_rules() {
        let ng = NodeGroup::new(
            "prod",
            "masters",
            NodeGroupSpec { cluster_name: String::new(), node_type: NodeType::Master, replicas: 0 },
        );
        let errs = validate_node_group(&ng, true);
        assert!(errs.mentions("spec.clusterName"));
        assert!(errs.mentions("spec.replicas"));
    }

    #[test]
    fn node_group_name_immutable() {
        let old = Node::new("prod", "n1", NodeSpec { node_group_name: "a".into(), host_name: None });
        let mut new = old.clone();
        new.spec.node_group_name = "b".into();
        let errs = validate_node_update(&new, &old);
        assert_eq!(errs.len(), 1);
        assert!(errs.mentions("spec.nodeGroupName"));
    }

    #[test]
    fn status_update_checks_identity() {
        let old = Node::new("prod", "n1", NodeSpec { node_group_name: "a".into(), host_name: None });
        let mut new = old.clone();
        new.metadata.name = "n2".into();
        assert!(validate_status_update(&new, &old).mentions("metadata.name"));
    }

    #[test]
    fn status_update_checks_metadata() {
        let old = Node::new("prod", "n1", NodeSpec { node_group_name: "a".into(), host_name: None });
        let mut new = old.clone();
        new.metadata.labels.insert("bad key!".into(), "ok".into());
        new.metadata.finalizers.push("has space".into());
        let errs = validate_status_update(&new, &old);
        assert!(errs.mentions("metadata.labels"));
        assert!(errs.mentions("metadata.finalizers[0]"));
        assert!(validate_status_update(&old, &old).is_empty());
    }

    #[test]
    fn duplicate_status_nodes() {
        let old = NodeGroup::new("prod", "g", NodeGroupSpec { cluster_name: "east".into(), ..Default::default() });
        let mut new = old.clone();
        new.status.nodes = vec!["n1".into(), "n1".into()];
        assert!(validate_node_group_status(&new, &old).mentions("status.nodes[1]"));
    }
}
