//! Bitable cell normalization and ordered field-alias lookup.
//!
//! Bitable returns cells in many shapes (plain strings, rich-text segment
//! arrays, person/link objects, numbers). Everything the pipeline reads goes
//! through [`normalize_value`] first so comparisons happen on plain text.

use serde_json::Value;

use crate::types::Fields;

/// Accepted column names for one logical attribute, tried in order.
pub type Aliases = &'static [&'static str];

/// Task id spellings across Bitable rows and capture databases.
pub const TASK_ID_ALIASES: Aliases = &["TaskID", "task_id", "TaskId", "taskid"];

/// Book id spellings across Task, ContentMeta and capture rows.
pub const BOOK_ID_ALIASES: Aliases = &["BookID", "book_id", "BookId", "bookid"];

/// Flatten a Bitable cell into trimmed text.
pub fn normalize_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            } else {
                n.to_string()
            }
        }
        Value::Array(items) => normalize_array(items),
        Value::Object(obj) => normalize_object(obj),
    }
}

fn normalize_array(items: &[Value]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let rich_text = items
        .iter()
        .any(|it| it.as_object().is_some_and(|o| o.contains_key("text")));
    if rich_text {
        let parts: Vec<String> = items
            .iter()
            .filter_map(|it| {
                if let Some(obj) = it.as_object() {
                    if let Some(text) = obj.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            return Some(text.trim().to_string());
                        }
                    }
                    let nested = obj.get("value").map(normalize_value).unwrap_or_default();
                    if !nested.is_empty() {
                        return Some(nested);
                    }
                    let whole = normalize_object(obj);
                    return (!whole.is_empty()).then_some(whole);
                }
                let text = normalize_value(it);
                (!text.is_empty()).then_some(text)
            })
            .collect();
        return parts.join(" ");
    }
    items
        .iter()
        .map(normalize_value)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_object(obj: &serde_json::Map<String, Value>) -> String {
    if obj.is_empty() {
        return String::new();
    }
    for key in ["value", "values", "elements", "content"] {
        if let Some(v) = obj.get(key) {
            let text = normalize_value(v);
            if !text.is_empty() {
                return text;
            }
        }
    }
    if let Some(text) = obj.get("text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }
    for key in ["link", "name", "en_name", "email", "id", "user_id", "url", "tmp_url", "file_token"] {
        if let Some(v) = obj.get(key) {
            let text = normalize_value(v);
            if !text.is_empty() {
                return text;
            }
        }
    }
    if ["address", "location", "pname", "cityname", "adname"]
        .iter()
        .any(|k| obj.contains_key(*k))
    {
        let parts: Vec<String> = ["location", "pname", "cityname", "adname"]
            .iter()
            .filter_map(|k| obj.get(*k).map(normalize_value))
            .filter(|s| !s.is_empty())
            .collect();
        if !parts.is_empty() {
            return parts.join(",");
        }
    }
    serde_json::to_string(obj).unwrap_or_default()
}

/// Parse a cell as a float. Booleans and blank cells yield `None`.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(_) | Value::Null => None,
        Value::Number(n) => n.as_f64(),
        other => normalize_value(other).parse::<f64>().ok(),
    }
}

/// Parse a cell as an integer, truncating fractional values.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    coerce_f64(value).filter(|f| f.is_finite()).map(|f| f as i64)
}

/// Epoch values below 1e11 are seconds; everything else is already millis.
pub fn normalize_epoch_millis(n: i64) -> i64 {
    if n < 100_000_000_000 { n * 1000 } else { n }
}

/// First present, non-blank value among `names`, in order.
pub fn first_value<'a>(fields: &'a Fields, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        fields
            .get(*name)
            .filter(|v| !normalize_value(v).is_empty())
    })
}

/// First non-blank normalized text among `names`.
pub fn first_text(fields: &Fields, names: &[&str]) -> String {
    first_value(fields, names).map(normalize_value).unwrap_or_default()
}

/// Resolve a configured column name first, then the historical aliases.
pub fn text_with_fallback(fields: &Fields, configured: &str, aliases: Aliases) -> String {
    let mut names: Vec<&str> = Vec::with_capacity(aliases.len() + 1);
    names.push(configured);
    names.extend(aliases.iter().copied().filter(|a| *a != configured));
    first_text(fields, &names)
}
