//! Field-level validation errors and the metadata rules shared by every kind.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

const DNS1123_LABEL_MAX: usize = 63;
const DNS1123_SUBDOMAIN_MAX: usize = 253;
const LABEL_VALUE_MAX: usize = 63;

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));
static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});
static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("static regex"));

/// Dotted path to a field, e.g. `metadata.labels[env]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(root: &str) -> Self {
        Self(root.to_string())
    }

    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}.{}", self.0, name))
    }

    pub fn index(&self, i: usize) -> Self {
        Self(format!("{}[{}]", self.0, i))
    }

    pub fn key(&self, k: &str) -> Self {
        Self(format!("{}[{}]", self.0, k))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldErrorType {
    Required,
    Invalid,
    Forbidden,
    Duplicate,
    NotSupported,
    TooLong,
}

impl FieldErrorType {
    fn as_str(&self) -> &'static str {
        match self {
            FieldErrorType::Required => "Required value",
            FieldErrorType::Invalid => "Invalid value",
            FieldErrorType::Forbidden => "Forbidden",
            FieldErrorType::Duplicate => "Duplicate value",
            FieldErrorType::NotSupported => "Unsupported value",
            FieldErrorType::TooLong => "Too long",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    #[serde(rename = "type")]
    pub type_: FieldErrorType,
    pub field: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl FieldError {
    fn new(type_: FieldErrorType, path: &FieldPath, value: &str, detail: impl Into<String>) -> Self {
        Self { type_, field: path.to_string(), value: value.to_string(), detail: detail.into() }
    }

    pub fn required(path: &FieldPath, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorType::Required, path, "", detail)
    }

    pub fn invalid(path: &FieldPath, value: &str, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorType::Invalid, path, value, detail)
    }

    pub fn forbidden(path: &FieldPath, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorType::Forbidden, path, "", detail)
    }

    pub fn duplicate(path: &FieldPath, value: &str) -> Self {
        Self::new(FieldErrorType::Duplicate, path, value, "")
    }

    pub fn not_supported(path: &FieldPath, value: &str, valid: &[&str]) -> Self {
        Self::new(FieldErrorType::NotSupported, path, value, format!("supported values: {}", valid.join(", ")))
    }

    pub fn too_long(path: &FieldPath, value: &str, max: usize) -> Self {
        Self::new(FieldErrorType::TooLong, path, value, format!("must have at most {} characters", max))
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.type_.as_str())?;
        if !self.value.is_empty() {
            write!(f, ": {:?}", self.value)?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, e: FieldError) {
        self.0.push(e);
    }

    pub fn extend(&mut self, other: FieldErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// Whether any error refers to `field`.
    pub fn mentions(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for e in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl From<Vec<FieldError>> for FieldErrors {
    fn from(v: Vec<FieldError>) -> Self {
        Self(v)
    }
}

/// Checks `value` against RFC 1123 label rules; returns the violations.
pub fn is_dns1123_label(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    if value.len() > DNS1123_LABEL_MAX {
        out.push(format!("must be no more than {} characters", DNS1123_LABEL_MAX));
    }
    if !DNS1123_LABEL.is_match(value) {
        out.push("a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character".to_string());
    }
    out
}

pub fn is_dns1123_subdomain(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    if value.len() > DNS1123_SUBDOMAIN_MAX {
        out.push(format!("must be no more than {} characters", DNS1123_SUBDOMAIN_MAX));
    }
    if !DNS1123_SUBDOMAIN.is_match(value) {
        out.push("a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character".to_string());
    }
    out
}

pub fn is_valid_label_value(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    if value.len() > LABEL_VALUE_MAX {
        out.push(format!("must be no more than {} characters", LABEL_VALUE_MAX));
    }
    if !LABEL_VALUE.is_match(value) {
        out.push("a valid label must be an empty string or consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character".to_string());
    }
    out
}

/// Label keys are `[prefix/]name` where prefix is a DNS subdomain.
pub fn is_qualified_name(value: &str) -> Vec<String> {
    let (prefix, name) = match value.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, value),
    };
    let mut out = Vec::new();
    if let Some(p) = prefix {
        if p.is_empty() {
            out.push("prefix part must be non-empty".to_string());
        } else {
            out.extend(is_dns1123_subdomain(p).into_iter().map(|m| format!("prefix part {}", m)));
        }
    }
    if name.is_empty() {
        out.push("name part must be non-empty".to_string());
    } else if name.len() > LABEL_VALUE_MAX || !LABEL_VALUE.is_match(name) {
        out.push("name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character (at most 63 characters)".to_string());
    }
    out
}

pub type NameValidator = fn(&str) -> Vec<String>;

/// Validates metadata on create. `namespaced` selects whether a namespace is
/// required or forbidden.
pub fn validate_object_meta(meta: &ObjectMeta, namespaced: bool, name_fn: NameValidator, path: &FieldPath) -> FieldErrors {
    let mut errs = FieldErrors::new();

    if meta.name.is_empty() && meta.generate_name.is_empty() {
        errs.push(FieldError::required(&path.child("name"), "name or generateName is required"));
    }
    if !meta.name.is_empty() {
        for msg in name_fn(&meta.name) {
            errs.push(FieldError::invalid(&path.child("name"), &meta.name, msg));
        }
    }
    if !meta.generate_name.is_empty() {
        let prefix = meta.generate_name.trim_end_matches('-');
        for msg in name_fn(prefix) {
            errs.push(FieldError::invalid(&path.child("generateName"), &meta.generate_name, msg));
        }
    }

    if namespaced {
        if meta.namespace.is_empty() {
            errs.push(FieldError::required(&path.child("namespace"), ""));
        } else {
            for msg in is_dns1123_label(&meta.namespace) {
                errs.push(FieldError::invalid(&path.child("namespace"), &meta.namespace, msg));
            }
        }
    } else if !meta.namespace.is_empty() {
        errs.push(FieldError::forbidden(&path.child("namespace"), "not allowed on this type"));
    }

    let labels = path.child("labels");
    for (k, v) in &meta.labels {
        for msg in is_qualified_name(k) {
            errs.push(FieldError::invalid(&labels, k, msg));
        }
        for msg in is_valid_label_value(v) {
            errs.push(FieldError::invalid(&labels.key(k), v, msg));
        }
    }
    let annotations = path.child("annotations");
    for k in meta.annotations.keys() {
        for msg in is_qualified_name(&k.to_ascii_lowercase()) {
            errs.push(FieldError::invalid(&annotations, k, msg));
        }
    }

    let finalizers = path.child("finalizers");
    for (i, f) in meta.finalizers.iter().enumerate() {
        if f.trim().is_empty() || f.chars().any(char::is_whitespace) {
            errs.push(FieldError::invalid(&finalizers.index(i), f, "finalizer must be a non-empty token without whitespace"));
        } else if meta.finalizers[..i].contains(f) {
            errs.push(FieldError::duplicate(&finalizers.index(i), f));
        }
    }
    errs
}

/// Identity fields cannot change once an object exists.
pub fn validate_object_meta_update(new: &ObjectMeta, old: &ObjectMeta, path: &FieldPath) -> FieldErrors {
    let mut errs = FieldErrors::new();
    if new.name != old.name {
        errs.push(FieldError::invalid(&path.child("name"), &new.name, "field is immutable"));
    }
    if new.namespace != old.namespace {
        errs.push(FieldError::invalid(&path.child("namespace"), &new.namespace, "field is immutable"));
    }
    if new.uid != old.uid {
        errs.push(FieldError::invalid(&path.child("uid"), &new.uid, "field is immutable"));
    }
    errs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_names() {
        assert!(is_dns1123_subdomain("east.cluster-1").is_empty());
        assert!(!is_dns1123_subdomain("East").is_empty());
        assert!(!is_dns1123_subdomain("-a").is_empty());
        assert!(is_dns1123_label("prod").is_empty());
        assert!(!is_dns1123_label("a.b").is_empty());
    }

    #[test]
    fn qualified_label_keys() {
        assert!(is_qualified_name("app").is_empty());
        assert!(is_qualified_name("keel.io/role").is_empty());
        assert!(!is_qualified_name("/role").is_empty());
        assert!(!is_qualified_name("keel.io/").is_empty());
    }

    #[test]
    fn meta_scope_rules() {
        let mut meta = ObjectMeta::named("", "h1");
        assert!(validate_object_meta(&meta, false, is_dns1123_subdomain, &FieldPath::new("metadata")).is_empty());
        let errs = validate_object_meta(&meta, true, is_dns1123_subdomain, &FieldPath::new("metadata"));
        assert!(errs.mentions("metadata.namespace"));

        meta.namespace = "default".into();
        let errs = validate_object_meta(&meta, false, is_dns1123_subdomain, &FieldPath::new("metadata"));
        assert_eq!(errs.len(), 1);
        assert_eq!(errs.0[0].type_, FieldErrorType::Forbidden);
    }

    #[test]
    fn duplicate_finalizers_flagged() {
        let mut meta = ObjectMeta::named("ns", "a");
        meta.finalizers = vec!["keel.io/cleanup".into(), "keel.io/cleanup".into()];
        let errs = validate_object_meta(&meta, true, is_dns1123_subdomain, &FieldPath::new("metadata"));
        assert!(errs.mentions("metadata.finalizers[1]"));
    }

    #[test]
    fn identity_is_immutable() {
        let old = ObjectMeta { uid: "u1".into(), ..ObjectMeta::named("ns", "a") };
        let mut new = old.clone();
        new.name = "b".into();
        let errs = validate_object_meta_update(&new, &old, &FieldPath::new("metadata"));
        assert_eq!(errs.to_string(), "metadata.name: Invalid value: \"b\": field is immutable");
    }
}
