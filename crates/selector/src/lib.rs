//! Label and field selectors, and the predicate that evaluates them against
//! the attribute set extracted from an object.
//!
//! Matching is pure and total: a label or field that is absent behaves as if
//! present with an empty value for (in)equality and set membership. Only the
//! existence operators look at presence.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod parse;

pub use parse::SelectorError;

pub type Set = BTreeMap<String, String>;

/// Labels and fields of one object, plus whether it still has initializers
/// pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub labels: Set,
    pub fields: Set,
    pub uninitialized: bool,
}

impl Attributes {
    pub fn new(labels: Set) -> Self {
        Self { labels, fields: Set::new(), uninitialized: false }
    }

    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    key: String,
    op: Operator,
    values: SmallVec<[String; 2]>,
}

impl Requirement {
    pub fn new<I, T>(key: impl Into<String>, op: Operator, values: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let key = key.into();
        parse::check_key(&key)?;
        let mut values: SmallVec<[String; 2]> = values.into_iter().map(Into::into).collect();
        for v in &values {
            parse::check_value(v)?;
        }
        match op {
            Operator::Equals | Operator::NotEquals if values.len() != 1 => {
                return Err(SelectorError::ValueCount { key, op, got: values.len() });
            }
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(SelectorError::ValueCount { key, op, got: 0 });
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(SelectorError::ValueCount { key, op, got: values.len() });
            }
            _ => {}
        }
        values.sort();
        values.dedup();
        Ok(Self { key, op, values })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.op
    }

    pub fn matches(&self, labels: &Set) -> bool {
        let present = labels.get(&self.key);
        let value = present.map(String::as_str).unwrap_or("");
        let contains = |v: &str| self.values.iter().any(|x| x == v);
        match self.op {
            Operator::Equals | Operator::In => contains(value),
            Operator::NotEquals | Operator::NotIn => !contains(value),
            Operator::Exists => present.is_some(),
            Operator::DoesNotExist => present.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Operator::Equals => write!(f, "{}={}", self.key, self.values[0]),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    reqs: SmallVec<[Requirement; 4]>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        parse::parse_labels(s)
    }

    /// Equality selector from `key -> value` pairs, e.g. `{"env": "prod"}`.
    pub fn from_map<I, K, V>(pairs: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut sorted: Vec<(String, String)> = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        sorted.sort();
        let mut sel = Self::default();
        for (k, v) in sorted {
            sel = sel.and(Requirement::new(k, Operator::Equals, [v])?);
        }
        Ok(sel)
    }

    pub fn and(mut self, req: Requirement) -> Self {
        self.reqs.push(req);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.reqs
    }

    pub fn matches(&self, labels: &Set) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        join(f, &self.reqs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRequirement {
    key: String,
    negated: bool,
    value: String,
}

impl FieldRequirement {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), negated: false, value: value.into() }
    }

    pub fn not_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), negated: true, value: value.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn matches(&self, fields: &Set) -> bool {
        let value = fields.get(&self.key).map(String::as_str).unwrap_or("");
        (value == self.value) != self.negated
    }
}

impl fmt::Display for FieldRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.negated { "!=" } else { "=" };
        write!(f, "{}{}{}", self.key, op, self.value)
    }
}

/// Conjunction of field (in)equality terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    reqs: SmallVec<[FieldRequirement; 2]>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        parse::parse_fields(s)
    }

    pub fn and(mut self, req: FieldRequirement) -> Self {
        self.reqs.push(req);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.reqs.iter().map(|r| r.key.as_str())
    }

    /// The value `key` is pinned to by an equality term, if any.
    pub fn exact(&self, key: &str) -> Option<&str> {
        self.reqs.iter().find(|r| r.key == key && !r.negated).map(|r| r.value.as_str())
    }

    pub fn matches(&self, fields: &Set) -> bool {
        self.reqs.iter().all(|r| r.matches(fields))
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        join(f, &self.reqs)
    }
}

/// Label selector and field selector evaluated together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub labels: LabelSelector,
    pub fields: FieldSelector,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(labels: &str, fields: &str) -> Result<Self, SelectorError> {
        Ok(Self { labels: LabelSelector::parse(labels)?, fields: FieldSelector::parse(fields)? })
    }

    pub fn with_labels(labels: LabelSelector) -> Self {
        Self { labels, fields: FieldSelector::default() }
    }

    pub fn with_fields(fields: FieldSelector) -> Self {
        Self { labels: LabelSelector::default(), fields }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.fields.is_empty()
    }

    pub fn requires_exact_field(&self, key: &str) -> Option<&str> {
        self.fields.exact(key)
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        self.labels.matches(&attrs.labels) && self.fields.matches(&attrs.fields)
    }
}

/// Free-function form of [`Selector::matches`] over raw label and field sets.
pub fn matches(selector: &Selector, labels: &Set, fields: &Set) -> bool {
    selector.labels.matches(labels) && selector.fields.matches(fields)
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[(&str, &str)]) -> Set {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn absent_label_acts_as_empty_value() {
        let empty = set(&[]);
        assert!(Requirement::new("env", Operator::NotEquals, ["prod"]).unwrap().matches(&empty));
        assert!(!Requirement::new("env", Operator::Equals, ["prod"]).unwrap().matches(&empty));
        assert!(Requirement::new("env", Operator::Equals, [""]).unwrap().matches(&empty));
        assert!(Requirement::new("env", Operator::NotIn, ["a", "b"]).unwrap().matches(&empty));
        assert!(!Requirement::new("env", Operator::Exists, Vec::<String>::new()).unwrap().matches(&empty));
        assert!(Requirement::new("env", Operator::DoesNotExist, Vec::<String>::new()).unwrap().matches(&empty));
    }

    #[test]
    fn value_count_is_checked() {
        assert!(matches!(
            Requirement::new("env", Operator::Equals, ["a", "b"]),
            Err(SelectorError::ValueCount { got: 2, .. })
        ));
        assert!(Requirement::new("env", Operator::In, Vec::<String>::new()).is_err());
        assert!(Requirement::new("env", Operator::Exists, ["x"]).is_err());
    }

    #[test]
    fn map_selector_is_conjunction() {
        let sel = LabelSelector::from_map([("tier", "web"), ("env", "prod")]).unwrap();
        assert_eq!(sel.to_string(), "env=prod,tier=web");
        assert!(sel.matches(&set(&[("env", "prod"), ("tier", "web"), ("x", "y")])));
        assert!(!sel.matches(&set(&[("env", "prod")])));
    }

    #[test]
    fn field_selector_missing_field_is_empty() {
        let fs = FieldSelector::everything().and(FieldRequirement::not_equals("metadata.namespace", "kube-system"));
        assert!(fs.matches(&set(&[])));
        let fs = FieldSelector::everything().and(FieldRequirement::equals("metadata.name", "a"));
        assert!(fs.matches(&set(&[("metadata.name", "a")])));
        assert!(!fs.matches(&set(&[("metadata.name", "b")])));
        assert_eq!(fs.exact("metadata.name"), Some("a"));
        assert_eq!(fs.exact("metadata.namespace"), None);
    }

    #[test]
    fn selector_combines_labels_and_fields() {
        let sel = Selector::parse("env=prod", "metadata.namespace=default").unwrap();
        let attrs = Attributes::new(set(&[("env", "prod")])).field("metadata.namespace", "default");
        assert!(sel.matches(&attrs));
        assert!(!matches(&sel, &attrs.labels, &set(&[("metadata.namespace", "other")])));
        assert!(Selector::everything().matches(&Attributes::default()));
    }
}
