//! The memorize and retrieve pipelines, plus the parsing helpers and
//! response shapes they share.
//!
//! Model output is unreliable; every parser here is tolerant. Tag
//! extraction is case-insensitive and accepts surrounding prose, JSON
//! payloads are pulled out of fenced or chatty responses by brace
//! balancing, and parse failures degrade (drop a segment, keep retrieving)
//! rather than abort.

pub mod memorize;
pub mod retrieve;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{MemoryCategory, MemoryItem, MemoryType, Modality, Resource, Scope};

pub use memorize::{MemorizePipeline, MemorizeRequest, MemorizeResponse};
pub use retrieve::{RetrievePipeline, RetrieveResponse};

// ============================================================================
// Query messages
// ============================================================================

/// Message content: a bare string or a `{ "text": ... }` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryContent {
    Text(String),
    Structured {
        #[serde(default)]
        text: String,
    },
}

/// One message-shaped query; the last entry of a retrieve call is the
/// current user turn, earlier entries are context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: QueryContent,
}

fn default_role() -> String {
    "user".to_string()
}

impl QueryMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: QueryContent::Text(text.into()),
        }
    }

    pub fn text(&self) -> &str {
        match &self.content {
            QueryContent::Text(text) => text,
            QueryContent::Structured { text } => text,
        }
    }
}

/// Pull the query text out of a message, rejecting empty content.
pub(crate) fn extract_query_text(message: &QueryMessage) -> Result<String> {
    let text = message.text().trim();
    if text.is_empty() {
        return Err(Error::InvalidInput("empty query message".to_string()));
    }
    Ok(text.to_string())
}

/// Format context messages for the sufficiency prompt.
pub(crate) fn format_query_context(messages: &[QueryMessage]) -> String {
    if messages.is_empty() {
        return "No query context.".to_string();
    }
    messages
        .iter()
        .map(|m| format!("- [{}]: {}", m.role, m.text()))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Tolerant parsing
// ============================================================================

/// Extract the content of the first `<tag>...</tag>` pair,
/// case-insensitively, across newlines.
pub(crate) fn extract_tag_content(raw: &str, tag: &str) -> Option<String> {
    static CACHE: LazyLock<parking_lot::Mutex<std::collections::HashMap<String, Regex>>> =
        LazyLock::new(|| parking_lot::Mutex::new(std::collections::HashMap::new()));

    let mut cache = CACHE.lock();
    let regex = cache.entry(tag.to_string()).or_insert_with(|| {
        #[allow(clippy::expect_used)]
        Regex::new(&format!("(?is)<{tag}>(.*?)</{tag}>")).expect("tag pattern")
    });
    let content = regex.captures(raw)?.get(1)?.as_str().trim().to_string();
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

/// Pull the first balanced JSON object out of a chatty response.
///
/// Handles fenced blocks and leading/trailing prose by scanning from the
/// first `{` with brace balancing that respects string literals.
pub(crate) fn extract_json_blob(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Strip markdown code fences the model sometimes wraps summaries in.
pub(crate) fn strip_code_fences(raw: &str) -> String {
    raw.replace("```markdown", "").replace("```", "").trim().to_string()
}

// ============================================================================
// Response views (records with embeddings stripped)
// ============================================================================

/// A resource as returned to callers: no embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceView {
    pub id: Uuid,
    pub url: String,
    pub modality: Modality,
    pub local_path: String,
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
    /// Similarity score on RAG retrieval hits; absent elsewhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl ResourceView {
    pub(crate) fn from_record(resource: &Resource, score: Option<f32>) -> Self {
        Self {
            id: resource.id,
            url: resource.url.clone(),
            modality: resource.modality.clone(),
            local_path: resource.local_path.clone(),
            caption: resource.caption.clone(),
            created_at: resource.created_at,
            updated_at: resource.updated_at,
            scope: resource.scope.clone(),
            score,
        }
    }
}

/// A memory item as returned to callers: no embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItemView {
    pub id: Uuid,
    pub resource_id: Option<Uuid>,
    pub memory_type: MemoryType,
    pub summary: String,
    pub happened_at: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl MemoryItemView {
    pub(crate) fn from_record(item: &MemoryItem, score: Option<f32>) -> Self {
        Self {
            id: item.id,
            resource_id: item.resource_id,
            memory_type: item.memory_type,
            summary: item.summary.clone(),
            happened_at: item.happened_at,
            extra: item.extra.clone(),
            created_at: item.created_at,
            updated_at: item.updated_at,
            scope: item.scope.clone(),
            score,
        }
    }
}

/// A category as returned to callers: no embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryView {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl CategoryView {
    pub(crate) fn from_record(category: &MemoryCategory, score: Option<f32>) -> Self {
        Self {
            id: category.id,
            name: category.name.clone(),
            description: category.description.clone(),
            summary: category.summary.clone(),
            created_at: category.created_at,
            updated_at: category.updated_at,
            scope: category.scope.clone(),
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_extraction_is_case_insensitive_and_multiline() {
        let raw = "prose <Decision>\nRETRIEVE\n</Decision> more prose";
        assert_eq!(extract_tag_content(raw, "decision").as_deref(), Some("RETRIEVE"));
    }

    #[test]
    fn tag_extraction_misses_return_none() {
        assert!(extract_tag_content("no tags here", "decision").is_none());
        assert!(extract_tag_content("<decision></decision>", "decision").is_none());
    }

    #[test]
    fn json_blob_survives_fences_and_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"items\": [\"a\", \"b\"]}\n```\nHope that helps.";
        assert_eq!(
            extract_json_blob(raw).as_deref(),
            Some("{\"items\": [\"a\", \"b\"]}")
        );
    }

    #[test]
    fn json_blob_balances_nested_objects_and_strings() {
        let raw = "x {\"a\": {\"b\": \"}\"}, \"c\": 1} y";
        assert_eq!(
            extract_json_blob(raw).as_deref(),
            Some("{\"a\": {\"b\": \"}\"}, \"c\": 1}")
        );
    }

    #[test]
    fn query_message_accepts_both_content_shapes() {
        let bare: QueryMessage =
            serde_json::from_str(r#"{"role": "user", "content": "hello"}"#).unwrap();
        assert_eq!(bare.text(), "hello");
        let structured: QueryMessage =
            serde_json::from_str(r#"{"role": "user", "content": {"text": "hi"}}"#).unwrap();
        assert_eq!(structured.text(), "hi");
    }

    #[test]
    fn empty_query_text_is_rejected() {
        let message = QueryMessage::user("   ");
        assert!(extract_query_text(&message).is_err());
    }

    #[test]
    fn code_fence_stripping() {
        assert_eq!(
            strip_code_fences("```markdown\n# Title\n```"),
            "# Title"
        );
    }
}
