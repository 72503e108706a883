//! Conversation formatting for the preprocess step.
//!
//! Conversations arrive as JSON message arrays. Before preprocessing they
//! are flattened to `role: text` lines and every non-empty line gets a
//! `[index]` marker. The indexed form is authoritative downstream: segment
//! ranges from the preprocess LLM refer to these indices, and extraction
//! sub-splits segments by them.

use serde_json::Value;

/// Flatten a conversation (JSON message array or plain text) and prepend
/// `[index]` markers to every non-empty line.
pub fn format_conversation_for_preprocess(raw: &str) -> String {
    let flattened = flatten_conversation(raw);
    add_line_indices(&flattened)
}

/// Turn a JSON conversation into `role: text` lines; non-JSON input passes
/// through unchanged.
fn flatten_conversation(raw: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    let Some(messages) = parsed.as_array() else {
        return raw.to_string();
    };

    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        let Some(obj) = message.as_object() else {
            continue;
        };
        let role = obj.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = match obj.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(content)) => content
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };
        if !text.trim().is_empty() {
            lines.push(format!("{role}: {text}"));
        }
    }
    if lines.is_empty() {
        raw.to_string()
    } else {
        lines.join("\n")
    }
}

/// Prepend `[index]` markers to non-empty lines; empty lines are preserved
/// without consuming an index.
fn add_line_indices(text: &str) -> String {
    let mut indexed = Vec::new();
    let mut index = 0usize;
    for line in text.split('\n') {
        if line.trim().is_empty() {
            indexed.push(line.to_string());
        } else {
            indexed.push(format!("[{index}] {line}"));
            index += 1;
        }
    }
    indexed.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_json_conversation_with_indices() {
        let raw = r#"[
            {"role": "user", "content": "Hi, I love coffee"},
            {"role": "assistant", "content": {"text": "Noted!"}}
        ]"#;
        let formatted = format_conversation_for_preprocess(raw);
        assert_eq!(formatted, "[0] user: Hi, I love coffee\n[1] assistant: Noted!");
    }

    #[test]
    fn plain_text_gets_indices_per_line() {
        let formatted = format_conversation_for_preprocess("first\n\nsecond");
        assert_eq!(formatted, "[0] first\n\n[1] second");
    }

    #[test]
    fn empty_messages_are_dropped() {
        let raw = r#"[{"role": "user", "content": ""}, {"role": "user", "content": "hello"}]"#;
        let formatted = format_conversation_for_preprocess(raw);
        assert_eq!(formatted, "[0] user: hello");
    }
}
