//! Coercion of untrusted LLM output into displayable text
//!
//! Provider output may be valid JSON, JSON embedded in prose, fenced code,
//! JSON with a truncated tail, or plain bullet prose. The cascade here is
//! strict parse → first-object scan → targeted string-literal extraction →
//! raw passthrough. Structured output contracts are never relied upon.

use serde_json::Value;

/// Marker substrings that identify unusable provider output
const UNUSABLE_MARKERS: [&str; 5] = [
    "llm unavailable",
    "failed to format input",
    "invalid codepoint",
    "loading model",
    "available commands",
];

/// Placeholder stored when the provider returned nothing usable
pub const LLM_UNAVAILABLE: &str = "(LLM unavailable)";

/// Whether the text matches a known unusable-output marker
pub fn is_unusable(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    UNUSABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Find and parse the first JSON object embedded in free-form text
///
/// Scans for `{` and attempts a prefix parse at each candidate, so prose
/// before or after the object does not matter.
pub fn extract_first_json_object(text: &str) -> Option<Value> {
    for (idx, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next()
            && value.is_object()
        {
            return Some(value);
        }
    }
    None
}

/// Extract a JSON string value for `key` from a JSON-ish blob
///
/// Works even when the overall JSON is truncated, as long as the target
/// string literal itself is intact.
pub fn extract_json_string_value(text: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let key_at = text.find(&needle)?;
    let after_key = &text[key_at + needle.len()..];
    let colon = after_key.find(':')?;
    let after_colon = &after_key[colon + 1..];
    let quote = after_colon.find('"')?;
    let literal_start = &after_colon[quote..];

    // Scan to the closing quote, respecting escapes.
    let bytes = literal_start.as_bytes();
    let mut esc = false;
    let mut end = None;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        if esc {
            esc = false;
            continue;
        }
        match b {
            b'\\' => esc = true,
            b'"' => {
                end = Some(i);
                break;
            }
            _ => {}
        }
    }
    let end = end?;
    serde_json::from_str::<String>(&literal_start[..=end]).ok()
}

/// Turn JSON/JSON-ish model output into a displayable summary string
pub fn coerce_summary_text(text: &str) -> String {
    let s = text.trim();
    if s.is_empty() {
        return String::new();
    }

    if let Some(obj) = extract_first_json_object(s)
        && let Some(v) = obj.get("summary")
    {
        let coerced = coerce_summary_value(v);
        if !coerced.is_empty() {
            return coerced;
        }
    }

    if let Some(v) = extract_json_string_value(s, "summary")
        && !v.trim().is_empty()
    {
        return v.trim().to_owned();
    }

    // Strip a code fence wrapper and retry on the inner content.
    if let Some(stripped) = strip_code_fence(s)
        && stripped != s
    {
        return coerce_summary_text(&stripped);
    }

    s.to_owned()
}

/// Normalize a summary field (string or list of strings) to display text
pub fn coerce_summary_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Array(items) => {
            let mut lines = Vec::new();
            for item in items {
                let Value::String(s) = item else { continue };
                let t = s.trim();
                if t.is_empty() {
                    continue;
                }
                if t.starts_with('-') {
                    lines.push(t.to_owned());
                } else {
                    lines.push(format!("- {t}"));
                }
            }
            lines.join("\n")
        }
        Value::Null => String::new(),
        other => other.to_string().trim().to_owned(),
    }
}

fn strip_code_fence(s: &str) -> Option<String> {
    if !s.starts_with("```") {
        return None;
    }
    let after_marker = s.trim_start_matches('`');
    // Drop an optional language tag on the opening fence line.
    let body = match after_marker.find('\n') {
        Some(pos) => &after_marker[pos + 1..],
        None => after_marker,
    };
    Some(body.trim_end_matches('`').trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::{
        LLM_UNAVAILABLE, coerce_summary_text, coerce_summary_value, extract_first_json_object,
        extract_json_string_value, is_unusable,
    };

    #[test]
    fn strict_json_object_wins() {
        let out = coerce_summary_text(r#"{"summary": "핵심 내용입니다", "tags": ["a"]}"#);
        assert_eq!(out, "핵심 내용입니다");
    }

    #[test]
    fn json_embedded_in_prose_is_found() {
        let text = "Sure! Here is the result:\n{\"summary\": \"done\", \"personal\": false}\nHope that helps.";
        let obj = extract_first_json_object(text).expect("object");
        assert_eq!(obj["summary"], "done");
    }

    #[test]
    fn truncated_json_still_yields_summary_literal() {
        let text = r#"{"summary": "salvageable text", "tags": ["a", "b"#;
        assert_eq!(
            extract_json_string_value(text, "summary").as_deref(),
            Some("salvageable text")
        );
        assert_eq!(coerce_summary_text(text), "salvageable text");
    }

    #[test]
    fn escaped_quotes_inside_literal_survive() {
        let text = r#"{"summary": "he said \"hi\" today""#;
        assert_eq!(
            extract_json_string_value(text, "summary").as_deref(),
            Some("he said \"hi\" today")
        );
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let text = "```json\n{\"summary\": \"fenced\"}\n```";
        assert_eq!(coerce_summary_text(text), "fenced");
    }

    #[test]
    fn list_valued_summary_becomes_bullets() {
        let v = serde_json::json!(["first", "- already bulleted", "  "]);
        assert_eq!(coerce_summary_value(&v), "- first\n- already bulleted");
    }

    #[test]
    fn plain_prose_passes_through() {
        assert_eq!(coerce_summary_text("- a\n- b"), "- a\n- b");
    }

    #[test]
    fn unusable_markers_are_detected() {
        assert!(is_unusable("(LLM unavailable: connection refused)"));
        assert!(is_unusable("Loading model, please wait..."));
        assert!(!is_unusable("- ordinary bullet content"));
        assert_eq!(LLM_UNAVAILABLE, "(LLM unavailable)");
    }
}
