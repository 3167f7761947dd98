//! Textual selector syntax:
//!
//! labels: `env=prod,tier!=db,zone in (a,b),stage notin (dev),canary,!legacy`
//! fields: `metadata.name=a,metadata.namespace!=kube-system`

use crate::{FieldRequirement, FieldSelector, LabelSelector, Operator, Requirement};

const RESERVED: &[char] = &[',', '(', ')', '!', '=', ' ', '\t'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty term in selector {0:?}")]
    EmptyTerm(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("unbalanced parentheses in {0:?}")]
    Unbalanced(String),
    #[error("unknown operator {0:?}")]
    UnknownOperator(String),
    #[error("{key}: operator {op:?} does not take {got} value(s)")]
    ValueCount { key: String, op: Operator, got: usize },
    #[error("field term {0:?} must be key=value or key!=value")]
    FieldTerm(String),
}

pub(crate) fn check_key(key: &str) -> Result<(), SelectorError> {
    if key.is_empty() || key.contains(RESERVED) {
        return Err(SelectorError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub(crate) fn check_value(value: &str) -> Result<(), SelectorError> {
    if value.contains(RESERVED) {
        return Err(SelectorError::InvalidValue(value.to_string()));
    }
    Ok(())
}

/// Splits on commas that are not inside a parenthesised value set.
fn split_terms(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorError::Unbalanced(s.to_string()));
                }
            }
            ',' if depth == 0 => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    out.push(s[start..].trim());
    Ok(out)
}

fn parse_set_term(term: &str) -> Result<Requirement, SelectorError> {
    let open = term.find('(').ok_or_else(|| SelectorError::Unbalanced(term.to_string()))?;
    if !term.ends_with(')') {
        return Err(SelectorError::Unbalanced(term.to_string()));
    }
    let head: Vec<&str> = term[..open].split_whitespace().collect();
    let (key, op) = match head.as_slice() {
        [key, "in"] => (*key, Operator::In),
        [key, "notin"] => (*key, Operator::NotIn),
        [_, other] => return Err(SelectorError::UnknownOperator((*other).to_string())),
        _ => return Err(SelectorError::UnknownOperator(term[..open].trim().to_string())),
    };
    let inner = &term[open + 1..term.len() - 1];
    let values: Vec<&str> = inner.split(',').map(str::trim).collect();
    if values.iter().all(|v| v.is_empty()) {
        return Err(SelectorError::ValueCount { key: key.to_string(), op, got: 0 });
    }
    Requirement::new(key, op, values)
}

fn parse_label_term(term: &str) -> Result<Requirement, SelectorError> {
    if term.contains('(') {
        return parse_set_term(term);
    }
    if let Some(key) = term.strip_prefix('!') {
        return Requirement::new(key.trim(), Operator::DoesNotExist, Vec::<String>::new());
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Requirement::new(k.trim(), Operator::NotEquals, [v.trim()]);
    }
    if let Some((k, v)) = term.split_once("==") {
        return Requirement::new(k.trim(), Operator::Equals, [v.trim()]);
    }
    if let Some((k, v)) = term.split_once('=') {
        return Requirement::new(k.trim(), Operator::Equals, [v.trim()]);
    }
    Requirement::new(term, Operator::Exists, Vec::<String>::new())
}

pub(crate) fn parse_labels(s: &str) -> Result<LabelSelector, SelectorError> {
    let mut sel = LabelSelector::default();
    if s.trim().is_empty() {
        return Ok(sel);
    }
    for term in split_terms(s)? {
        if term.is_empty() {
            return Err(SelectorError::EmptyTerm(s.to_string()));
        }
        sel = sel.and(parse_label_term(term)?);
    }
    Ok(sel)
}

pub(crate) fn parse_fields(s: &str) -> Result<FieldSelector, SelectorError> {
    let mut sel = FieldSelector::default();
    if s.trim().is_empty() {
        return Ok(sel);
    }
    for term in s.split(',').map(str::trim) {
        if term.is_empty() {
            return Err(SelectorError::EmptyTerm(s.to_string()));
        }
        let req = if let Some((k, v)) = term.split_once("!=") {
            FieldRequirement::not_equals(k.trim(), v.trim())
        } else if let Some((k, v)) = term.split_once("==") {
            FieldRequirement::equals(k.trim(), v.trim())
        } else if let Some((k, v)) = term.split_once('=') {
            FieldRequirement::equals(k.trim(), v.trim())
        } else {
            return Err(SelectorError::FieldTerm(term.to_string()));
        };
        check_key(req.key())?;
        check_value(&req.value)?;
        sel = sel.and(req);
    }
    Ok(sel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_outside_parens_only() {
        assert_eq!(split_terms("a in (x,y),b=c").unwrap(), vec!["a in (x,y)", "b=c"]);
        assert!(split_terms("a in (x").is_err());
        assert!(split_terms("a)").is_err());
    }

    #[test]
    fn parses_every_operator() {
        let sel = parse_labels("env=prod, tier!=db,zone in (b, a),stage notin (dev),canary,!legacy,x==y").unwrap();
        let ops: Vec<Operator> = sel.requirements().iter().map(|r| r.operator()).collect();
        assert_eq!(
            ops,
            vec![
                Operator::Equals,
                Operator::NotEquals,
                Operator::In,
                Operator::NotIn,
                Operator::Exists,
                Operator::DoesNotExist,
                Operator::Equals
            ]
        );
        assert_eq!(sel.to_string(), "env=prod,tier!=db,zone in (a,b),stage notin (dev),canary,!legacy,x=y");
    }

    #[test]
    fn rejects_malformed_terms() {
        assert!(matches!(parse_labels("a=b,,c=d"), Err(SelectorError::EmptyTerm(_))));
        assert!(matches!(parse_labels("a within (b)"), Err(SelectorError::UnknownOperator(_))));
        assert!(matches!(parse_labels("a in ()"), Err(SelectorError::ValueCount { .. })));
        assert!(matches!(parse_labels("=b"), Err(SelectorError::InvalidKey(_))));
        assert!(matches!(parse_fields("metadata.name"), Err(SelectorError::FieldTerm(_))));
    }

    #[test]
    fn empty_strings_select_everything() {
        assert!(parse_labels("  ").unwrap().is_empty());
        assert!(parse_fields("").unwrap().is_empty());
    }
}
