use keel_core::config::ConfigError;
use keel_core::validation::is_dns1123_label;
use keel_core::{ClusterSpec, HostSpec, Kind, NodeGroupSpec, NodeSpec, Spec, StorageConfig};
use tracing::debug;

use crate::descriptor::{KeyLayout, ResourceDescriptor};
use crate::kinds;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{kind}: plural {plural:?} is not a valid path segment")]
    InvalidPlural { kind: Kind, plural: String },
    #[error("{kind}: layout prefix {got:?} does not match registry prefix {expected:?}")]
    PrefixMismatch { kind: Kind, expected: String, got: String },
    #[error("{a} and {b} share the plural {plural:?}")]
    DuplicatePlural { a: Kind, b: Kind, plural: String },
    #[error("{a} root {root_a:?} overlaps {b} root {root_b:?}")]
    OverlappingRoots { a: Kind, root_a: String, b: Kind, root_b: String },
    #[error("{kind}: key {key:?} is not a child of {root:?}")]
    KeyEscapesRoot { kind: Kind, key: String, root: String },
    #[error("{kind}: constructor produced kind {got:?}")]
    KindMismatch { kind: Kind, got: String },
}

/// Startup-time table of descriptors, one per kind.
#[derive(Debug, Clone)]
pub struct Registry {
    prefix: String,
    clusters: ResourceDescriptor<ClusterSpec>,
    hosts: ResourceDescriptor<HostSpec>,
    node_groups: ResourceDescriptor<NodeGroupSpec>,
    nodes: ResourceDescriptor<NodeSpec>,
}

/// Kinds the registry knows how to look up by type.
pub trait Registered: Spec {
    fn descriptor(registry: &Registry) -> &ResourceDescriptor<Self>;
}

impl Registered for ClusterSpec {
    fn descriptor(registry: &Registry) -> &ResourceDescriptor<Self> {
        &registry.clusters
    }
}

impl Registered for HostSpec {
    fn descriptor(registry: &Registry) -> &ResourceDescriptor<Self> {
        &registry.hosts
    }
}

impl Registered for NodeGroupSpec {
    fn descriptor(registry: &Registry) -> &ResourceDescriptor<Self> {
        &registry.node_groups
    }
}

impl Registered for NodeSpec {
    fn descriptor(registry: &Registry) -> &ResourceDescriptor<Self> {
        &registry.nodes
    }
}

impl Registry {
    /// Builds the default descriptors under the configured prefix.
    pub fn new(config: &StorageConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        let prefix = config.normalized_prefix();
        Self::from_descriptors(
            prefix,
            kinds::cluster_descriptor(prefix),
            kinds::host_descriptor(prefix),
            kinds::node_group_descriptor(prefix),
            kinds::node_descriptor(prefix),
        )
    }

    /// Assembles a registry from explicit descriptors, rejecting any layout
    /// that could place two objects at the same key.
    pub fn from_descriptors(
        prefix: &str,
        clusters: ResourceDescriptor<ClusterSpec>,
        hosts: ResourceDescriptor<HostSpec>,
        node_groups: ResourceDescriptor<NodeGroupSpec>,
        nodes: ResourceDescriptor<NodeSpec>,
    ) -> Result<Self, RegistryError> {
        let prefix = if prefix == "/" { "" } else { prefix };
        let registry = Self { prefix: prefix.to_string(), clusters, hosts, node_groups, nodes };
        check_constructors(&registry.clusters)?;
        check_constructors(&registry.hosts)?;
        check_constructors(&registry.node_groups)?;
        check_constructors(&registry.nodes)?;

        let layouts = registry.layouts();
        for (kind, layout) in &layouts {
            check_layout(prefix, *kind, layout)?;
        }
        for (i, (a, la)) in layouts.iter().enumerate() {
            for (b, lb) in &layouts[i + 1..] {
                if la.plural() == lb.plural() {
                    return Err(RegistryError::DuplicatePlural { a: *a, b: *b, plural: la.plural().to_string() });
                }
                let (ra, rb) = (format!("{}/", la.type_root()), format!("{}/", lb.type_root()));
                if ra.starts_with(&rb) || rb.starts_with(&ra) {
                    return Err(RegistryError::OverlappingRoots {
                        a: *a,
                        root_a: la.type_root(),
                        b: *b,
                        root_b: lb.type_root(),
                    });
                }
            }
        }
        debug!(prefix = %registry.prefix, kinds = layouts.len(), "registry built");
        Ok(registry)
    }

    pub fn descriptor<S: Registered>(&self) -> &ResourceDescriptor<S> {
        S::descriptor(self)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn layouts(&self) -> Vec<(Kind, &KeyLayout)> {
        vec![
            (Kind::Cluster, &self.clusters.layout),
            (Kind::Host, &self.hosts.layout),
            (Kind::NodeGroup, &self.node_groups.layout),
            (Kind::Node, &self.nodes.layout),
        ]
    }

    pub fn layout(&self, kind: Kind) -> &KeyLayout {
        match kind {
            Kind::Cluster => &self.clusters.layout,
            Kind::Host => &self.hosts.layout,
            Kind::NodeGroup => &self.node_groups.layout,
            Kind::Node => &self.nodes.layout,
        }
    }
}

fn check_constructors<S: Spec>(d: &ResourceDescriptor<S>) -> Result<(), RegistryError> {
    let empty = (d.new_empty)();
    if empty.type_meta.kind != S::KIND.as_str() {
        return Err(RegistryError::KindMismatch { kind: S::KIND, got: empty.type_meta.kind });
    }
    let list = (d.new_list)();
    if list.type_meta.kind != S::KIND.list_kind() {
        return Err(RegistryError::KindMismatch { kind: S::KIND, got: list.type_meta.kind });
    }
    Ok(())
}

fn check_layout(prefix: &str, kind: Kind, layout: &KeyLayout) -> Result<(), RegistryError> {
    if layout.plural().is_empty() || !is_dns1123_label(layout.plural()).is_empty() {
        return Err(RegistryError::InvalidPlural { kind, plural: layout.plural().to_string() });
    }
    if layout.prefix() != prefix {
        return Err(RegistryError::PrefixMismatch {
            kind,
            expected: prefix.to_string(),
            got: layout.prefix().to_string(),
        });
    }
    // Probe the key function: every key must sit strictly under its scope root.
    let scopes: &[&str] = if layout.is_namespaced() { &["probe-a", "probe-b"] } else { &[""] };
    let mut seen = Vec::new();
    for scope in scopes {
        let root = layout.range_prefix(scope);
        let key = layout
            .key_for(scope, "probe", kind)
            .map_err(|_| RegistryError::KeyEscapesRoot { kind, key: String::new(), root: root.clone() })?;
        if !key.starts_with(&root) || key.len() == root.len() {
            return Err(RegistryError::KeyEscapesRoot { kind, key, root });
        }
        if seen.contains(&key) {
            return Err(RegistryError::KeyEscapesRoot { kind, key, root });
        }
        seen.push(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry() {
        let reg = Registry::new(&StorageConfig::default()).unwrap();
        assert_eq!(reg.prefix(), "/keel");
        let nodes = reg.descriptor::<NodeSpec>();
        assert_eq!(nodes.key_for("prod", "n1").unwrap(), "/keel/nodes/prod/n1");
        assert!(!reg.descriptor::<HostSpec>().is_namespaced());
        assert_eq!(reg.layout(Kind::NodeGroup).type_root(), "/keel/nodegroups");
    }

    #[test]
    fn root_prefix() {
        let cfg = StorageConfig { prefix: "/".into(), ..Default::default() };
        let reg = Registry::new(&cfg).unwrap();
        assert_eq!(reg.descriptor::<HostSpec>().key_for("", "h1").unwrap(), "/hosts/h1");
    }

    #[test]
    fn duplicate_plural_rejected() {
        let mut nodes = kinds::node_descriptor("/keel");
        nodes.layout = KeyLayout::new("/keel", "nodegroups", true);
        let err = Registry::from_descriptors(
            "/keel",
            kinds::cluster_descriptor("/keel"),
            kinds::host_descriptor("/keel"),
            kinds::node_group_descriptor("/keel"),
            nodes,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePlural { .. }));
    }

    #[test]
    fn invalid_plural_rejected() {
        let mut hosts = kinds::host_descriptor("/keel");
        hosts.layout = KeyLayout::new("/keel", "hosts/extra", false);
        let err = Registry::from_descriptors(
            "/keel",
            kinds::cluster_descriptor("/keel"),
            hosts,
            kinds::node_group_descriptor("/keel"),
            kinds::node_descriptor("/keel"),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPlural { kind: Kind::Host, .. }));
    }

    #[test]
    fn prefix_mismatch_rejected() {
        let err = Registry::from_descriptors(
            "/keel",
            kinds::cluster_descriptor("/other"),
            kinds::host_descriptor("/keel"),
            kinds::node_group_descriptor("/keel"),
            kinds::node_descriptor("/keel"),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::PrefixMismatch { kind: Kind::Cluster, .. }));
    }

    #[test]
    fn bad_config_prefix_rejected() {
        let cfg = StorageConfig { prefix: "keel".into(), ..Default::default() };
        assert!(matches!(Registry::new(&cfg), Err(RegistryError::Config(_))));
    }
}
