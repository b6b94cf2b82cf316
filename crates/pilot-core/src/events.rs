//! Agent stream events.
//!
//! The agent subprocess writes newline-delimited JSON (`--output-format
//! stream-json`). Each line is decoded once into an [`AgentEvent`]; the
//! engine works only with the enum and never reads raw JSON fields.

use crate::types::LogLevel;
use serde_json::Value;

/// Maximum characters of a message kept in a log entry. The accumulated
/// output keeps the full text.
pub const LOG_MESSAGE_LIMIT: usize = 500;

/// One element of an assistant message's content list.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    /// Tool invocation. Arguments are dropped.
    ToolUse { name: String },
}

/// A decoded line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Session init; carries the model name when present.
    System { model: Option<String> },
    Assistant { blocks: Vec<ContentBlock> },
    /// Flat tool-use event.
    ToolUse { name: String },
    /// Terminal success marker.
    Result {
        text: String,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    Error { message: String },
    /// Unknown `type`; ignored.
    Other { kind: Option<String> },
    /// A line that is not a JSON object (merged stderr, plain text replies).
    Text(String),
}

/// Decode one raw line. Blank lines yield `None`.
pub fn parse_line(raw: &[u8]) -> Option<AgentEvent> {
    let decoded = String::from_utf8_lossy(raw);
    let line = decoded.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => Some(from_value(&value)),
        _ => Some(AgentEvent::Text(line.to_string())),
    }
}

/// Dispatch a JSON object on its `type` field.
pub fn from_value(event: &Value) -> AgentEvent {
    let kind = event.get("type").and_then(Value::as_str);
    match kind {
        Some("system") => AgentEvent::System {
            model: event
                .get("model")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .map(String::from),
        },
        Some("assistant") => AgentEvent::Assistant {
            blocks: assistant_blocks(event.get("message")),
        },
        Some("tool_use") => AgentEvent::ToolUse {
            name: str_field(event, "tool")
                .or_else(|| str_field(event, "name"))
                .unwrap_or_default(),
        },
        Some("result") => AgentEvent::Result {
            text: match event.get("result") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            cost_usd: ["total_cost_usd", "cost_usd", "cost"]
                .iter()
                .find_map(|key| event.get(*key).and_then(Value::as_f64)),
            duration_ms: event.get("duration_ms").and_then(Value::as_u64),
        },
        Some("error") => AgentEvent::Error {
            message: match event.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => event.to_string(),
            },
        },
        other => AgentEvent::Other {
            kind: other.map(String::from),
        },
    }
}

fn str_field(event: &Value, key: &str) -> Option<String> {
    event.get(key).and_then(Value::as_str).map(String::from)
}

fn assistant_blocks(message: Option<&Value>) -> Vec<ContentBlock> {
    match message {
        Some(Value::Object(obj)) => obj
            .get("content")
            .and_then(Value::as_array)
            .map(|content| {
                content
                    .iter()
                    .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                        Some("text") => block
                            .get("text")
                            .and_then(Value::as_str)
                            .filter(|t| !t.is_empty())
                            .map(|t| ContentBlock::Text(t.to_string())),
                        Some("tool_use") => Some(ContentBlock::ToolUse {
                            name: str_field(block, "name").unwrap_or_default(),
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Some(Value::String(s)) if !s.is_empty() => vec![ContentBlock::Text(s.clone())],
        _ => Vec::new(),
    }
}

impl AgentEvent {
    /// Text this event contributes to the accumulated output.
    pub fn output_fragments(&self) -> Vec<&str> {
        match self {
            Self::Assistant { blocks } => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(t) => Some(t.as_str()),
                    ContentBlock::ToolUse { .. } => None,
                })
                .collect(),
            Self::Result { text, .. } if !text.is_empty() => vec![text.as_str()],
            Self::Error { message } => vec![message.as_str()],
            Self::Text(line) => vec![line.as_str()],
            _ => Vec::new(),
        }
    }

    /// Log lines for this event, already truncated.
    pub fn log_lines(&self) -> Vec<(LogLevel, String)> {
        match self {
            Self::System { model: Some(model) } => {
                vec![(LogLevel::Sys, format!("Model: {model}"))]
            }
            Self::System { model: None } | Self::Other { .. } => Vec::new(),
            Self::Assistant { blocks } => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text(t) => {
                        (LogLevel::Agent, truncate_message(t, LOG_MESSAGE_LIMIT))
                    }
                    ContentBlock::ToolUse { name } => (LogLevel::Tool, format!("Tool: {name}")),
                })
                .collect(),
            Self::ToolUse { name } => vec![(LogLevel::Tool, format!("Tool: {name}"))],
            Self::Result {
                text,
                cost_usd,
                duration_ms,
            } => {
                let mut lines = Vec::with_capacity(2);
                if !text.is_empty() {
                    lines.push((LogLevel::Result, truncate_message(text, LOG_MESSAGE_LIMIT)));
                }
                let duration = duration_ms
                    .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
                    .unwrap_or_default();
                let cost = cost_usd
                    .filter(|c| *c > 0.0)
                    .map(|c| format!(" (${c:.4})"))
                    .unwrap_or_default();
                lines.push((LogLevel::Sys, format!("Agent finished{duration}{cost}")));
                lines
            }
            Self::Error { message } => {
                vec![(LogLevel::Error, truncate_message(message, LOG_MESSAGE_LIMIT))]
            }
            Self::Text(line) => {
                vec![(LogLevel::Agent, truncate_message(line, LOG_MESSAGE_LIMIT))]
            }
        }
    }

    /// Cost reported by a result event.
    pub fn cost_usd(&self) -> Option<f64> {
        match self {
            Self::Result { cost_usd, .. } => *cost_usd,
            _ => None,
        }
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_message(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Keep the last `max_chars` characters of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    match s.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
