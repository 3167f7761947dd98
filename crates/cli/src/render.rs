use chrono::{DateTime, Utc};
use keel_core::{Object, Spec};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Row {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub age: String,
    pub labels: String,
}

impl Row {
    pub fn of<S: Spec>(obj: &Object<S>, now: DateTime<Utc>) -> Self {
        let labels: Vec<String> = obj.metadata.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        Self {
            kind: S::KIND.as_str(),
            namespace: if obj.namespace().is_empty() { "-".into() } else { obj.namespace().to_string() },
            name: obj.name().to_string(),
            resource_version: obj.resource_version().to_string(),
            age: render_age(obj.metadata.creation_timestamp, now),
            labels: labels.join(","),
        }
    }
}

pub fn print_table(rows: &[Row]) {
    println!("{:<10} {:<12} {:<24} {:<6} {:<6} LABELS", "KIND", "NAMESPACE", "NAME", "RV", "AGE");
    for r in rows {
        println!("{:<10} {:<12} {:<24} {:<6} {:<6} {}", r.kind, r.namespace, r.name, r.resource_version, r.age, r.labels);
    }
}

pub fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}
