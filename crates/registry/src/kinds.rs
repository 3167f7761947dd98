//! Default descriptors for the four built-in kinds.

use keel_core::{
    Cluster, ClusterSpec, Host, HostSpec, Kind, Node, NodeGroup, NodeGroupSpec, NodeSpec, NodeType,
    Object, ObjectList, Spec,
};
use keel_selector::{Attributes, Set};

use crate::descriptor::{KeyLayout, ResourceDescriptor};
use crate::validation::{self as v, validate_status_update};

pub const CLUSTER_FIELDS: &[&str] = &["metadata.name", "metadata.namespace"];
pub const HOST_FIELDS: &[&str] = &["metadata.name", "status.phase"];
pub const NODE_GROUP_FIELDS: &[&str] =
    &["metadata.name", "metadata.namespace", "spec.clusterName", "spec.nodeType"];
pub const NODE_FIELDS: &[&str] =
    &["metadata.name", "metadata.namespace", "spec.nodeGroupName", "spec.hostName", "status.phase"];

/// Whether a kind lives inside a namespace by default.
pub fn default_namespaced(kind: Kind) -> bool {
    !matches!(kind, Kind::Host)
}

/// Labels, identity fields and the initializer flag shared by every kind.
pub fn meta_attributes<S: Spec>(obj: &Object<S>, namespaced: bool) -> Attributes {
    let labels: Set = obj.metadata.labels.clone();
    let mut attrs = Attributes::new(labels).field("metadata.name", &obj.metadata.name);
    if namespaced {
        attrs = attrs.field("metadata.namespace", &obj.metadata.namespace);
    }
    attrs.uninitialized = obj.metadata.is_uninitialized();
    attrs
}

fn cluster_attributes(obj: &Cluster) -> Attributes {
    meta_attributes(obj, true)
}

fn host_attributes(obj: &Host) -> Attributes {
    meta_attributes(obj, false).field("status.phase", &format!("{:?}", obj.status.phase))
}

fn node_group_attributes(obj: &NodeGroup) -> Attributes {
    let node_type = match obj.spec.node_type {
        NodeType::Master => "Master",
        NodeType::Compute => "Compute",
    };
    meta_attributes(obj, true)
        .field("spec.clusterName", &obj.spec.cluster_name)
        .field("spec.nodeType", node_type)
}

fn node_attributes(obj: &Node) -> Attributes {
    meta_attributes(obj, true)
        .field("spec.nodeGroupName", &obj.spec.node_group_name)
        .field("spec.hostName", obj.spec.host_name.as_deref().unwrap_or(""))
        .field("status.phase", &format!("{:?}", obj.status.phase))
}

fn layout<S: Spec>(prefix: &str) -> KeyLayout {
    KeyLayout::new(prefix, S::KIND.plural(), default_namespaced(S::KIND))
}

pub fn cluster_descriptor(prefix: &str) -> ResourceDescriptor<ClusterSpec> {
    ResourceDescriptor {
        layout: layout::<ClusterSpec>(prefix),
        selectable_fields: CLUSTER_FIELDS,
        attributes: cluster_attributes,
        validate_create: v::validate_cluster,
        validate_update: v::validate_cluster_update,
        validate_status_update: validate_status_update::<ClusterSpec>,
        new_empty: Object::empty,
        new_list: ObjectList::empty,
    }
}

pub fn host_descriptor(prefix: &str) -> ResourceDescriptor<HostSpec> {
    ResourceDescriptor {
        layout: layout::<HostSpec>(prefix),
        selectable_fields: HOST_FIELDS,
        attributes: host_attributes,
        validate_create: v::validate_host,
        validate_update: v::validate_host_update,
        validate_status_update: validate_status_update::<HostSpec>,
        new_empty: Object::empty,
        new_list: ObjectList::empty,
    }
}

pub fn node_group_descriptor(prefix: &str) -> ResourceDescriptor<NodeGroupSpec> {
    ResourceDescriptor {
        layout: layout::<NodeGroupSpec>(prefix),
        selectable_fields: NODE_GROUP_FIELDS,
        attributes: node_group_attributes,
        validate_create: v::validate_node_group,
        validate_update: v::validate_node_group_update,
        validate_status_update: v::validate_node_group_status,
        new_empty: Object::empty,
        new_list: ObjectList::empty,
    }
}

pub fn node_descriptor(prefix: &str) -> ResourceDescriptor<NodeSpec> {
    ResourceDescriptor {
        layout: layout::<NodeSpec>(prefix),
        selectable_fields: NODE_FIELDS,
        attributes: node_attributes,
        validate_create: v::validate_node,
        validate_update: v::validate_node_update,
        validate_status_update: validate_status_update::<NodeSpec>,
        new_empty: Object::empty,
        new_list: ObjectList::empty,
    }
}
