use keel_core::{FieldErrors, Kind, Object, ObjectList, Spec};
use keel_selector::Attributes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("name is required")]
    EmptyName,
    #[error("name {0:?} may not contain '/' or be '.' or '..'")]
    InvalidName(String),
    #[error("namespace is required for namespaced kind {0}")]
    MissingNamespace(Kind),
}

/// `<prefix>/<plural>/[<namespace>/]<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    plural: String,
    namespaced: bool,
}

impl KeyLayout {
    pub fn new(prefix: &str, plural: &str, namespaced: bool) -> Self {
        let prefix = if prefix == "/" { String::new() } else { prefix.to_string() };
        Self { prefix, plural: plural.to_string(), namespaced }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn plural(&self) -> &str {
        &self.plural
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    /// Root shared by every object of this kind.
    pub fn type_root(&self) -> String {
        format!("{}/{}", self.prefix, self.plural)
    }

    /// Root of one scope. An empty scope on a namespaced kind means all
    /// namespaces; cluster-scoped kinds ignore the scope.
    pub fn key_root(&self, scope: &str) -> String {
        if self.namespaced && !scope.is_empty() {
            format!("{}/{}/{}", self.prefix, self.plural, scope)
        } else {
            self.type_root()
        }
    }

    /// Prefix to range over for a scope; the trailing slash keeps `ns` from
    /// matching `ns2`.
    pub fn range_prefix(&self, scope: &str) -> String {
        format!("{}/", self.key_root(scope))
    }

    pub fn key_for(&self, scope: &str, name: &str, kind: Kind) -> Result<String, KeyError> {
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        if name.contains('/') || name == "." || name == ".." {
            return Err(KeyError::InvalidName(name.to_string()));
        }
        if self.namespaced {
            if scope.is_empty() {
                return Err(KeyError::MissingNamespace(kind));
            }
            if scope.contains('/') || scope == "." || scope == ".." {
                return Err(KeyError::InvalidName(scope.to_string()));
            }
        }
        Ok(format!("{}/{}", self.key_root(scope), name))
    }
}

pub type AttributesFn<S> = fn(&Object<S>) -> Attributes;
pub type ValidateFn<S> = fn(&Object<S>, bool) -> FieldErrors;
pub type ValidateUpdateFn<S> = fn(&Object<S>, &Object<S>) -> FieldErrors;

/// Immutable per-kind configuration.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor<S: Spec> {
    pub layout: KeyLayout,
    /// Field keys accepted in field selectors.
    pub selectable_fields: &'static [&'static str],
    pub attributes: AttributesFn<S>,
    pub validate_create: ValidateFn<S>,
    pub validate_update: ValidateUpdateFn<S>,
    pub validate_status_update: ValidateUpdateFn<S>,
    pub new_empty: fn() -> Object<S>,
    pub new_list: fn() -> ObjectList<S>,
}

impl<S: Spec> ResourceDescriptor<S> {
    pub fn kind(&self) -> Kind {
        S::KIND
    }

    pub fn is_namespaced(&self) -> bool {
        self.layout.is_namespaced()
    }

    pub fn key_root(&self, scope: &str) -> String {
        self.layout.key_root(scope)
    }

    pub fn key_for(&self, scope: &str, name: &str) -> Result<String, KeyError> {
        self.layout.key_for(scope, name, S::KIND)
    }

    pub fn attributes_of(&self, obj: &Object<S>) -> Attributes {
        (self.attributes)(obj)
    }

    pub fn supports_field(&self, key: &str) -> bool {
        self.selectable_fields.contains(&key)
    }

    pub fn validate(&self, obj: &Object<S>) -> FieldErrors {
        (self.validate_create)(obj, self.is_namespaced())
    }
}
