//! Multi-document YAML manifests.

use anyhow::{Context, Result};
use keel_core::AnyObject;
use serde::Deserialize;

/// Decodes every non-empty document in `text`, in order.
pub fn parse(text: &str) -> Result<Vec<AnyObject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_json::Value::deserialize(doc).with_context(|| format!("document {i}: not valid YAML"))?;
        if value.is_null() {
            continue;
        }
        let obj = AnyObject::from_value(value).with_context(|| format!("document {i}"))?;
        out.push(obj);
    }
    Ok(out)
}
