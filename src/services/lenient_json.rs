//! Tolerant JSON extraction from oracle completions.
//!
//! Language models wrap JSON in prose and markdown fences. Extraction
//! order: strip fences, try a direct parse, then pull out the first
//! balanced `{…}` (or `[…]` when arrays are acceptable) by depth
//! counting that respects string literals and escapes.

use serde_json::Value;

/// Strip a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();

    for prefix in ["```json", "```"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            if let Some(end) = rest.rfind("```") {
                return rest[..end].trim();
            }
        }
    }

    trimmed
}

/// Extract a JSON object from the text.
pub fn extract_object(text: &str) -> Option<Value> {
    let stripped = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        if value.is_object() {
            return Some(value);
        }
    }

    balanced_slice(stripped, '{', '}')
        .and_then(|slice| serde_json::from_str(slice).ok())
}

/// Extract a JSON object or array from the text.
pub fn extract_value(text: &str) -> Option<Value> {
    let stripped = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    if let Some(value) = balanced_slice(stripped, '{', '}')
        .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
    {
        return Some(value);
    }

    balanced_slice(stripped, '[', ']')
        .and_then(|slice| serde_json::from_str(slice).ok())
}

/// Find the first balanced `open … close` span, ignoring brackets that
/// appear inside string literals.
fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let value = extract_object(r#"{"verdict": "PASS"}"#).unwrap();
        assert_eq!(value["verdict"], "PASS");
    }

    #[test]
    fn test_fenced_json() {
        let text = "```json\n{\"verdict\": \"PASS\"}\n```";
        let value = extract_object(text).unwrap();
        assert_eq!(value["verdict"], "PASS");

        let text = "```\n{\"verdict\": \"RETRY\"}\n```";
        let value = extract_object(text).unwrap();
        assert_eq!(value["verdict"], "RETRY");
    }

    #[test]
    fn test_json_embedded_in_prose() {
        let text = "Here is my verdict:\n{\"verdict\": \"PASS\", \"reasoning\": \"looks good\"}\nLet me know.";
        let value = extract_object(text).unwrap();
        assert_eq!(value["verdict"], "PASS");
    }

    #[test]
    fn test_nested_braces_and_strings() {
        let text = r#"Result: {"a": {"b": "contains } brace"}, "c": "and { another"} trailing"#;
        let value = extract_object(text).unwrap();
        assert_eq!(value["a"]["b"], "contains } brace");
    }

    #[test]
    fn test_escaped_quote_in_string() {
        let text = r#"{"key": "quote \" then } brace"}"#;
        let value = extract_object(text).unwrap();
        assert_eq!(value["key"], "quote \" then } brace");
    }

    #[test]
    fn test_bare_array_accepted_by_extract_value() {
        let value = extract_value(r#"["profile", "fix N+1"]"#).unwrap();
        assert!(value.is_array());

        let value = extract_value("Steps:\n[\"a\", \"b\"]").unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_extract_object_rejects_bare_array() {
        assert!(extract_object(r#"["a", "b"]"#).is_none());
    }

    #[test]
    fn test_garbage_returns_none() {
        assert!(extract_object("no json here at all").is_none());
        assert!(extract_value("{truncated").is_none());
    }
}
