use serde_json::{Map, Value};

pub(crate) fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

/// Finds the JSON object in a model reply, tolerating code fences and
/// surrounding prose.
pub(crate) fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    for candidate in candidates {
        if let Ok(parsed) = serde_json::from_str::<Value>(&candidate) {
            if let Some(object) = parsed.as_object() {
                return Some(object.clone());
            }
        }
    }
    None
}

/// Whitespace-collapsed, case-insensitively de-duplicated list of strings.
/// A bare string is split on commas.
pub(crate) fn coerce_text_list(
    value: Option<&Value>,
    max_items: usize,
    max_chars: usize,
) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let mut raw_items: Vec<String> = Vec::new();
    match value {
        Value::Array(rows) => {
            for row in rows {
                if let Some(text) = row.as_str() {
                    raw_items.push(text.to_string());
                }
            }
        }
        Value::String(text) => {
            raw_items.extend(text.split(',').map(str::to_string));
        }
        _ => {}
    }

    let mut cleaned = Vec::new();
    let mut seen = Vec::new();
    for row in raw_items {
        let mut text = row.split_whitespace().collect::<Vec<&str>>().join(" ");
        if text.is_empty() {
            continue;
        }
        if text.chars().count() > max_chars {
            text = text
                .chars()
                .take(max_chars)
                .collect::<String>()
                .trim()
                .to_string();
        }
        let key = text.to_ascii_lowercase();
        if seen.iter().any(|existing| existing == &key) {
            continue;
        }
        seen.push(key);
        cleaned.push(text);
        if cleaned.len() >= max_items {
            break;
        }
    }
    cleaned
}

/// Reads an integer score from a number or numeric string, clamped to 0..=100.
pub(crate) fn coerce_score(value: Option<&Value>) -> Option<u8> {
    let raw = match value? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
