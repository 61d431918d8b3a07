//! Server-sent event decoding for streamed prompt answers.

use serde_json::Value;

/// Whether `body` looks like an event stream rather than a plain JSON body.
pub fn is_event_stream(body: &str) -> bool {
    body.lines().any(|line| line.trim_start().starts_with("data:"))
}

/// Concatenates the answer fragments carried by the `data:` lines of `body`.
///
/// Fragments are taken from `answer`, `message.answer`, `message` (when a
/// string), `text` or `content`, in that order of preference. `[DONE]` and
/// blank payloads are skipped. A payload that is not JSON is appended as-is
/// unless it starts with `{`, which marks a truncated object.
pub fn collect_answer(body: &str) -> String {
    let mut answer = String::new();

    for line in body.lines() {
        let Some(data) = line.trim_start().strip_prefix("data:") else {
            continue;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);

        if data.trim().is_empty() || data.trim() == "[DONE]" {
            continue;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(event) => {
                if let Some(fragment) = fragment_of(&event) {
                    answer.push_str(fragment);
                }
            }
            Err(_) if !data.starts_with('{') => answer.push_str(data),
            Err(_) => {
                tracing::debug!(data, "Skipping malformed event payload");
            }
        }
    }

    answer.trim().to_string()
}

fn fragment_of(event: &Value) -> Option<&str> {
    if let Some(answer) = event.get("answer") {
        return answer.as_str();
    }
    if let Some(message) = event.get("message") {
        return match message {
            Value::String(s) => Some(s),
            other => other.get("answer").and_then(Value::as_str),
        };
    }
    event
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| event.get("content").and_then(Value::as_str))
}
