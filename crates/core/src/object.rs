//! The generic resource envelope and the closed set of stored kinds.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::apis::{Cluster, ClusterSpec, Host, HostSpec, Node, NodeGroup, NodeGroupSpec, NodeSpec};
use crate::meta::{ObjectMeta, TypeMeta};

pub const API_VERSION: &str = "keel.io/v1alpha1";

/// Resource kinds served by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Cluster,
    Host,
    Node,
    NodeGroup,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Cluster, Kind::Host, Kind::Node, Kind::NodeGroup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Cluster => "Cluster",
            Kind::Host => "Host",
            Kind::Node => "Node",
            Kind::NodeGroup => "NodeGroup",
        }
    }

    /// Lowercase plural used in key paths.
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Cluster => "clusters",
            Kind::Host => "hosts",
            Kind::Node => "nodes",
            Kind::NodeGroup => "nodegroups",
        }
    }

    pub fn list_kind(&self) -> String {
        format!("{}List", self.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.plural().eq_ignore_ascii_case(s))
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

/// Desired state of a resource kind. The associated `Status` is the observed
/// state, written only through the status subresource.
pub trait Spec:
    Clone + fmt::Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Status: Clone
        + fmt::Debug
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    const KIND: Kind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Object<S: Spec> {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: S,
    #[serde(default)]
    pub status: S::Status,
}

impl<S: Spec> Object<S> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: S) -> Self {
        Self {
            type_meta: TypeMeta::new(S::KIND.as_str()),
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: S::Status::default(),
        }
    }

    /// Empty shell of this kind, with only the type discriminator set.
    pub fn empty() -> Self {
        Self::new("", "", S::default())
    }

    pub fn kind(&self) -> Kind {
        S::KIND
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels.extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_finalizers<I, T>(mut self, finalizers: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.metadata.finalizers.extend(finalizers.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ObjectList<S: Spec> {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Object<S>>,
}

impl<S: Spec> ObjectList<S> {
    pub fn empty() -> Self {
        Self {
            type_meta: TypeMeta::new(S::KIND.list_kind()),
            metadata: ListMeta::default(),
            items: Vec::new(),
        }
    }

    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|o| o.name()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("object has no kind")]
    MissingKind,
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("decoding {kind}: {source}")]
    Json {
        kind: Kind,
        #[source]
        source: serde_json::Error,
    },
}

/// A resource of any served kind, recovered from an untyped document by its
/// `kind` field.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyObject {
    Cluster(Cluster),
    Host(Host),
    Node(Node),
    NodeGroup(NodeGroup),
}

impl AnyObject {
    pub fn from_value(value: serde_json::Value) -> Result<Self, DecodeError> {
        let kind: Kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or(DecodeError::MissingKind)?
            .parse()?;
        let wrap = |source| DecodeError::Json { kind, source };
        Ok(match kind {
            Kind::Cluster => AnyObject::Cluster(decode::<ClusterSpec>(value).map_err(wrap)?),
            Kind::Host => AnyObject::Host(decode::<HostSpec>(value).map_err(wrap)?),
            Kind::Node => AnyObject::Node(decode::<NodeSpec>(value).map_err(wrap)?),
            Kind::NodeGroup => AnyObject::NodeGroup(decode::<NodeGroupSpec>(value).map_err(wrap)?),
        })
    }

    pub fn kind(&self) -> Kind {
        match self {
            AnyObject::Cluster(_) => Kind::Cluster,
            AnyObject::Host(_) => Kind::Host,
            AnyObject::Node(_) => Kind::Node,
            AnyObject::NodeGroup(_) => Kind::NodeGroup,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            AnyObject::Cluster(o) => &o.metadata,
            AnyObject::Host(o) => &o.metadata,
            AnyObject::Node(o) => &o.metadata,
            AnyObject::NodeGroup(o) => &o.metadata,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            AnyObject::Cluster(o) => serde_json::to_value(o),
            AnyObject::Host(o) => serde_json::to_value(o),
            AnyObject::Node(o) => serde_json::to_value(o),
            AnyObject::NodeGroup(o) => serde_json::to_value(o),
        }
    }
}

fn decode<S: Spec>(value: serde_json::Value) -> Result<Object<S>, serde_json::Error> {
    let mut obj: Object<S> = serde_json::from_value(value)?;
    // apiVersion is optional in manifests
    if obj.type_meta.api_version.is_empty() {
        obj.type_meta.api_version = API_VERSION.to_string();
    }
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_singular_and_plural() {
        assert_eq!("nodegroup".parse::<Kind>().unwrap(), Kind::NodeGroup);
        assert_eq!("Hosts".parse::<Kind>().unwrap(), Kind::Host);
        assert!("pod".parse::<Kind>().is_err());
    }

    #[test]
    fn any_object_dispatches_on_kind() {
        let v = serde_json::json!({
            "kind": "NodeGroup",
            "metadata": {"namespace": "default", "name": "workers"},
            "spec": {"clusterName": "c1", "nodeType": "Compute", "replicas": 3},
        });
        let obj = AnyObject::from_value(v).unwrap();
        assert_eq!(obj.kind(), Kind::NodeGroup);
        assert_eq!(obj.metadata().name, "workers");
        match obj {
            AnyObject::NodeGroup(ng) => {
                assert_eq!(ng.spec.replicas, 3);
                assert_eq!(ng.type_meta.api_version, API_VERSION);
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn any_object_without_kind_is_rejected() {
        let err = AnyObject::from_value(serde_json::json!({"metadata": {"name": "x"}})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingKind));
    }

    #[test]
    fn envelope_round_trips_status() {
        let mut c = Cluster::new("ns", "c", ClusterSpec { kubernetes_version: "1.30".into(), ..Default::default() });
        c.status.ready = true;
        let text = serde_json::to_string(&c).unwrap();
        let back: Cluster = serde_json::from_str(&text).unwrap();
        assert_eq!(back, c);
        assert!(text.contains("\"kind\":\"Cluster\""));
    }
}
