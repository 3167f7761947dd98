//! Per-kind storage descriptors and the registry that owns them.
//!
//! The registry is an explicit value built once at startup and handed to
//! every store; all per-kind behaviour (key layout, attribute extraction,
//! validation, constructors) travels through descriptor function fields.

#![forbid(unsafe_code)]

mod descriptor;
pub mod kinds;
mod registry;
pub mod validation;

pub use descriptor::{KeyError, KeyLayout, ResourceDescriptor};
pub use registry::{Registered, Registry, RegistryError};
