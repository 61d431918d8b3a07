//! JSON extraction utilities for parsing generation service output.
//!
//! Prompt-generation answers are model output: usually a bare JSON object,
//! sometimes wrapped in a markdown fence or surrounded by prose. The helpers
//! here recover the object and strip the fences from free-text fields.
//!
//! # Extraction Strategies
//!
//! [`parse_json_object`] tries the following strategies in order:
//! 1. Direct JSON (the whole text parses)
//! 2. JSON in a markdown code block
//! 3. The outermost `{ ... }` slice of the text
//!
//! # Example
//!
//! ```
//! use outreach_forge::utils::json_extraction::parse_json_object;
//!
//! let answer = "Sure! {\"task_id\": \"t-1\"} Hope this helps.";
//! let value = parse_json_object(answer).unwrap();
//! assert_eq!(value["task_id"], "t-1");
//! ```

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },

    #[error("Response contains JSON that is not an object: {kind}")]
    NotAnObject { kind: &'static str },
}

fn preview(content: &str) -> String {
    content.chars().take(200).collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a JSON object out of model output.
///
/// # Errors
///
/// Returns `JsonExtractionError::NotFound` when no strategy yields valid JSON
/// and `NotAnObject` when the text is valid JSON of another kind.
pub fn parse_json_object(content: &str) -> Result<Map<String, Value>, JsonExtractionError> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Object(map) => Ok(map),
            other => Err(JsonExtractionError::NotAnObject {
                kind: kind_of(&other),
            }),
        };
    }

    let candidates = [
        extract_from_code_block(trimmed),
        outermost_object_slice(trimmed).map(str::to_string),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .ok_or_else(|| JsonExtractionError::NotFound {
            content_preview: preview(trimmed),
        })
}

/// Extract the body of the first ``` code block that looks like a JSON object.
pub fn extract_from_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:[A-Za-z]+)?[ \t]*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    let block = caps.get(1)?.as_str().trim();
    block.starts_with('{').then(|| block.to_string())
}

/// The slice from the first `{` to the last `}`, if any.
pub fn outermost_object_slice(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Remove a surrounding markdown code fence from free text.
///
/// A leading fence line (with an optional language tag) and a trailing
/// fence are removed; text without fences is only trimmed.
pub fn strip_markdown_fences(text: &str) -> String {
    let mut cleaned = text.trim();

    if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest,
        };
    }

    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest.trim_end();
    }

    cleaned.trim().to_string()
}
