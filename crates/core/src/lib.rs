//! Keel core types: the object envelope shared by every stored resource,
//! the closed set of resource kinds, field-level validation errors and
//! storage configuration.

#![forbid(unsafe_code)]

pub mod apis;
pub mod config;
pub mod meta;
pub mod object;
pub mod validation;

pub use apis::{
    Cluster, ClusterSpec, ClusterStatus, Condition, Host, HostPhase, HostSpec, HostStatus, Node,
    NodeGroup, NodeGroupSpec, NodeGroupStatus, NodePhase, NodeSpec, NodeStatus, NodeType,
};
pub use config::{ConfigError, StorageConfig};
pub use meta::{ObjectMeta, OwnerReference, TypeMeta};
pub use object::{AnyObject, DecodeError, Kind, Object, ObjectList, Spec};
pub use validation::{FieldError, FieldErrorType, FieldErrors, FieldPath};
