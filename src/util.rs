//! Shared utility functions for the scriptorium crate.

use crate::errors::ParseError;
use serde_json::Value;

/// Extract a JSON object from text that may contain other content.
/// Prefers a fenced ```json block, then falls back to brace-counting to find
/// the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let after_marker = &text[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Locate and parse the JSON object embedded in a model response.
pub fn parse_json_object(text: &str) -> Result<Value, ParseError> {
    let json = extract_json_object(text).ok_or(ParseError::NoJson)?;
    let value: Value = serde_json::from_str(&json)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(ParseError::InvalidValue {
            field: "<root>",
            value: json,
        })
    }
}

/// Read a string field, defaulting to empty.
pub fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Read an array of strings, skipping non-string entries.
pub fn str_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
