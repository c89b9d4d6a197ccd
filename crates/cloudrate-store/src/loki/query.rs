//! LogQL query construction.

use std::collections::BTreeMap;

use cloudrate_core::{Filters, TYPE_FIELD};

/// Label name of a JSON field extracted by `| json`: every character other
/// than an ASCII letter, digit or `_` becomes `_`.
#[must_use]
pub fn label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn regex_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Stream labels of lines pushed under `scope_id`.
#[must_use]
pub fn stream_labels(
    static_labels: &BTreeMap<String, String>,
    scope_key: &str,
    scope_id: &str,
) -> BTreeMap<String, String> {
    let mut labels = static_labels.clone();
    labels.insert(label_name(scope_key), scope_id.to_string());
    labels
}

/// Stream selector: the static labels plus the scope filter, if any.
#[must_use]
pub fn build_selector(static_labels: &BTreeMap<String, String>, scope_key: &str, filters: &Filters) -> String {
    let mut matchers: Vec<String> = static_labels
        .iter()
        .map(|(k, v)| format!("{}={}", label_name(k), quote(v)))
        .collect();
    if let Some(scope_id) = filters.get(scope_key) {
        matchers.push(format!("{}={}", label_name(scope_key), quote(scope_id)));
    }
    format!("{{{}}}", matchers.join(", "))
}

/// Full query: selector, JSON parsing, then label filters.
///
/// Every remaining filter matches the groupby or the metadata value.
#[must_use]
pub fn build_query(
    static_labels: &BTreeMap<String, String>,
    scope_key: &str,
    filters: &Filters,
    metric_types: Option<&[String]>,
) -> String {
    let mut query = build_selector(static_labels, scope_key, filters);
    query.push_str(" | json");

    for (key, value) in filters {
        if key == TYPE_FIELD || key == scope_key {
            continue;
        }
        let label = label_name(key);
        let value = quote(value);
        query.push_str(&format!(" | groupby_{label}={value} or metadata_{label}={value}"));
    }
    if let Some(metric_type) = filters.get(TYPE_FIELD) {
        query.push_str(&format!(" | type={}", quote(metric_type)));
    }
    match metric_types {
        Some([single]) => query.push_str(&format!(" | type={}", quote(single))),
        Some(types) if !types.is_empty() => {
            let pattern: Vec<String> = types.iter().map(|t| regex_escape(t)).collect();
            query.push_str(&format!(" | type=~{}", quote(&pattern.join("|"))));
        }
        _ => {}
    }
    query
}

/// Selector with line filters, accepted by the deletion API.
///
/// Non-scope filters match the `"key":"value"` pair anywhere in the line,
/// so a groupby or a metadata value both qualify.
#[must_use]
pub fn build_delete_query(static_labels: &BTreeMap<String, String>, scope_key: &str, filters: &Filters) -> String {
    let mut query = build_selector(static_labels, scope_key, filters);
    for (key, value) in filters {
        if key == scope_key {
            continue;
        }
        let pair = format!(
            "{}:{}",
            serde_json::Value::String(key.clone()),
            serde_json::Value::String(value.clone())
        );
        query.push_str(&format!(" |= {}", quote(&pair)));
    }
    query
}
