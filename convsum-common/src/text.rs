//! Text normalization for ML result payloads
//!
//! The ML service returns list-ish fields (products, unresolved issues,
//! action items) in whatever shape its model produced: JSON arrays,
//! objects, JSON embedded in strings, or plain text. The summary store
//! keeps clean comma-separated text, so everything funnels through here
//! before persistence.

use serde_json::Value;

/// Text fields mined out of an action-item object, in priority order
const ACTION_TEXT_FIELDS: &[&str] = &[
    "action",
    "description",
    "name",
    "instructions",
    "task",
    "item",
    "text",
];

/// Normalize a payload field to clean comma-separated text
///
/// `["a", "b"]` becomes `a, b`; `{"k": "v"}` becomes `k: v`; strings are
/// parsed as JSON first and fall back to bracket/quote stripping.
pub fn normalize_csv(value: Option<&Value>) -> String {
    let value = match value {
        Some(v) => v,
        None => return String::new(),
    };

    match value {
        Value::Null => String::new(),
        Value::Array(items) => join_nonempty(items.iter().map(scalar_text)),
        Value::Object(map) => join_nonempty(map.iter().map(|(k, v)| {
            let v = scalar_text(v);
            if v.is_empty() {
                String::new()
            } else {
                format!("{}: {}", k, v)
            }
        })),
        Value::String(s) => {
            // Strings may carry embedded JSON
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                if parsed.is_array() || parsed.is_object() {
                    return normalize_csv(Some(&parsed));
                }
            }
            join_nonempty(strip_json_punctuation(s).split(',').map(|p| p.trim().to_string()))
        }
        other => scalar_text(other),
    }
}

/// Extract only the action text from an action-items payload
///
/// Objects contribute their first non-empty text field (metadata like
/// due_date, priority or assignee is dropped); plain strings pass
/// through. The result is truncated to `max_length`, preferring to cut
/// at the last complete item.
pub fn extract_action_items(value: Option<&Value>, max_length: usize) -> String {
    let value = match value {
        Some(v) => v,
        None => return String::new(),
    };

    let value = match value {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => return extract_from_parsed(&parsed, max_length),
            Err(_) => {
                let cleaned = strip_json_punctuation(s);
                return truncate_at_boundary(cleaned.trim(), max_length);
            }
        },
        other => other,
    };

    extract_from_parsed(value, max_length)
}

fn extract_from_parsed(value: &Value, max_length: usize) -> String {
    let mut actions: Vec<String> = Vec::new();

    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) => {
                        let text = action_text_from_object(item);
                        if !text.is_empty() {
                            actions.push(text);
                        }
                    }
                    other => {
                        let text = scalar_text(other);
                        if !text.is_empty() {
                            actions.push(text);
                        }
                    }
                }
            }
        }
        Value::Object(_) => {
            let text = action_text_from_object(value);
            if !text.is_empty() {
                actions.push(text);
            }
        }
        other => {
            let text = scalar_text(other);
            if !text.is_empty() {
                actions.push(text);
            }
        }
    }

    truncate_at_boundary(&actions.join(", "), max_length)
}

fn action_text_from_object(value: &Value) -> String {
    for field in ACTION_TEXT_FIELDS {
        if let Some(text) = value.get(*field).map(scalar_text) {
            if !text.is_empty() {
                return text;
            }
        }
    }
    // No known text field: drop the item rather than leak metadata
    String::new()
}

fn scalar_text(value: &Value) -> String {
    let s = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let s = strip_json_punctuation(&s);
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("none") {
        String::new()
    } else {
        trimmed.to_string()
    }
}

fn strip_json_punctuation(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '[' | ']' | '{' | '}' | '"' | '\''))
        .collect()
}

fn join_nonempty<I: Iterator<Item = String>>(parts: I) -> String {
    parts
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Truncate to `max_length`, cutting at the last comma when that keeps at
/// least half of the budget
fn truncate_at_boundary(s: &str, max_length: usize) -> String {
    if s.len() <= max_length {
        return s.to_string();
    }

    let mut cut = max_length;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut result = s[..cut].to_string();

    if let Some(last_comma) = result.rfind(',') {
        if last_comma > max_length / 2 {
            result.truncate(last_comma);
        }
    }

    result.trim_end_matches([',', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_array() {
        assert_eq!(normalize_csv(Some(&json!(["a", "b", "c"]))), "a, b, c");
        assert_eq!(normalize_csv(Some(&json!([]))), "");
    }

    #[test]
    fn normalize_object() {
        assert_eq!(normalize_csv(Some(&json!({"plan": "fiber"}))), "plan: fiber");
    }

    #[test]
    fn normalize_embedded_json_string() {
        assert_eq!(normalize_csv(Some(&json!("[\"x\", \"y\"]"))), "x, y");
    }

    #[test]
    fn normalize_plain_string_strips_brackets() {
        assert_eq!(normalize_csv(Some(&json!("[roaming], 'upgrade'"))), "roaming, upgrade");
        assert_eq!(normalize_csv(None), "");
    }

    #[test]
    fn action_items_extract_text_fields_only() {
        let items = json!([
            {"action": "call back tomorrow", "due_date": "2026-09-01", "priority": "high"},
            {"description": "send invoice copy", "assignee": "agent7"},
            "escalate to tier 2"
        ]);
        assert_eq!(
            extract_action_items(Some(&items), 500),
            "call back tomorrow, send invoice copy, escalate to tier 2"
        );
    }

    #[test]
    fn action_items_drop_metadata_only_objects() {
        let items = json!([{"due_date": "2026-09-01", "status": "open"}]);
        assert_eq!(extract_action_items(Some(&items), 500), "");
    }

    #[test]
    fn action_items_truncate_at_item_boundary() {
        let items = json!([
            {"action": "aaaaaaaaaa"},
            {"action": "bbbbbbbbbb"},
            {"action": "cccccccccc"}
        ]);
        let out = extract_action_items(Some(&items), 25);
        assert_eq!(out, "aaaaaaaaaa, bbbbbbbbbb");
    }

    #[test]
    fn action_items_json_string_input() {
        let raw = json!("[{\"action\": \"replace router\"}]");
        assert_eq!(extract_action_items(Some(&raw), 500), "replace router");
    }
}
