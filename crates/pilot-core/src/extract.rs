//! Recover JSON embedded in free-form agent output.
//!
//! Agents are not obliged to emit clean JSON; they wrap it in prose or
//! markdown fences. Three strategies are tried in order: the whole text, the
//! first fenced code block, then a balanced-bracket scan that ignores
//! brackets inside string literals.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
});

/// Expected top-level JSON type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Array,
    Object,
}

impl JsonShape {
    fn open(self) -> char {
        match self {
            Self::Array => '[',
            Self::Object => '{',
        }
    }

    fn close(self) -> char {
        match self {
            Self::Array => ']',
            Self::Object => '}',
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Find the first JSON value of the requested shape in `text`.
pub fn extract_json(text: &str, shape: JsonShape) -> Option<Value> {
    let trimmed = text.trim();

    if let Some(value) = parse_shaped(trimmed, shape) {
        return Some(value);
    }

    if let Some(inner) = first_fenced_block(trimmed) {
        if let Some(value) = parse_shaped(inner.trim(), shape) {
            return Some(value);
        }
    }

    scan_balanced(trimmed, shape)
}

/// Extract and deserialize into `T`.
pub fn extract_as<T: DeserializeOwned>(text: &str, shape: JsonShape) -> Option<T> {
    extract_json(text, shape).and_then(|v| serde_json::from_value(v).ok())
}

fn parse_shaped(candidate: &str, shape: JsonShape) -> Option<Value> {
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(|v| shape.matches(v))
}

fn first_fenced_block(text: &str) -> Option<&str> {
    FENCED_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Try every occurrence of the opening bracket until one yields a balanced,
/// parseable candidate.
fn scan_balanced(text: &str, shape: JsonShape) -> Option<Value> {
    let open = shape.open();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find(open) {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..], open, shape.close()) {
            if let Some(value) = parse_shaped(&text[start..start + end], shape) {
                return Some(value);
            }
        }
        search_from = start + open.len_utf8();
    }

    None
}

/// Byte length of the balanced region starting at `text[0] == open`, or
/// `None` if it never closes.
fn balanced_end(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(idx + c.len_utf8());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn raw_array() {
        assert_eq!(
            extract_json(r#"[{"title":"a"}]"#, JsonShape::Array),
            Some(json!([{"title": "a"}]))
        );
    }

    #[test]
    fn fenced_json_block() {
        let text = "Here is the plan:\n```json\n[{\"title\":\"a\"}]\n```\nDone.";
        assert_eq!(
            extract_json(text, JsonShape::Array),
            Some(json!([{"title": "a"}]))
        );
    }

    #[test]
    fn fence_without_language_tag() {
        let text = "```\n{\"ok\": true}\n```";
        assert_eq!(extract_json(text, JsonShape::Object), Some(json!({"ok": true})));
    }

    #[test]
    fn prose_wrapped_with_brackets_in_strings() {
        let text = r#"I split the "[goal]" into parts, see "a ] b": [{"title":"a"}] Let me know [if] that works."#;
        assert_eq!(
            extract_json(text, JsonShape::Array),
            Some(json!([{"title": "a"}]))
        );
    }

    #[test]
    fn brackets_inside_json_strings_are_not_counted() {
        let text = r#"Result: [{"title":"fix ] and [ parsing","note":"say \"]\""}] end"#;
        let value = extract_json(text, JsonShape::Array).unwrap();
        assert_eq!(value[0]["title"], "fix ] and [ parsing");
        assert_eq!(value[0]["note"], "say \"]\"");
    }

    #[test]
    fn failed_candidate_resumes_from_next_opener() {
        let text = "[not json] then [1, 2, 3]";
        assert_eq!(extract_json(text, JsonShape::Array), Some(json!([1, 2, 3])));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        assert_eq!(extract_json(r#"{"a": 1}"#, JsonShape::Array), None);
        assert_eq!(
            extract_json(r#"list [1] and object {"a": [2]}"#, JsonShape::Object),
            Some(json!({"a": [2]}))
        );
    }

    #[test]
    fn fenced_block_of_wrong_shape_falls_through_to_scan() {
        let text = "```json\n{\"summary\": \"x\"}\n```\nTasks: [\"one\"]";
        assert_eq!(extract_json(text, JsonShape::Array), Some(json!(["one"])));
    }

    #[test]
    fn nothing_found() {
        assert_eq!(extract_json("no json here", JsonShape::Array), None);
        assert_eq!(extract_json("[unclosed", JsonShape::Array), None);
        assert_eq!(extract_json("", JsonShape::Object), None);
    }

    #[test]
    fn typed_extraction() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Item {
            title: String,
        }
        let items: Vec<Item> =
            extract_as("Sure!\n[{\"title\":\"a\"},{\"title\":\"b\"}]", JsonShape::Array).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].title, "b");
    }
}
