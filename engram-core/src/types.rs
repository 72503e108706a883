//! Core record types shared across the engine.
//!
//! Every persisted record carries an opaque id, creation/update timestamps,
//! and a [`Scope`]: the set of equality-filterable fields (at minimum
//! `user_id`) that partitions the dataset per user.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Discriminants
// ============================================================================

/// The kind of an ingested resource.
///
/// Unknown values are preserved in [`Modality::Other`] so callers with
/// custom preprocess templates can route their own modalities through the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Modality {
    /// A JSON-shaped chat transcript
    Conversation,
    /// A text document
    Document,
    /// A still image
    Image,
    /// An audio file or pre-transcribed audio text
    Audio,
    /// A video file
    Video,
    /// Plain text with no preprocessing template
    Text,
    /// Any other caller-defined modality
    Other(String),
}

impl Modality {
    /// Modalities whose preprocessing requires decoded text.
    pub fn requires_text(&self) -> bool {
        matches!(self, Modality::Conversation | Modality::Document)
    }

    /// Stable lowercase name used in config keys and storage rows.
    pub fn as_str(&self) -> &str {
        match self {
            Modality::Conversation => "conversation",
            Modality::Document => "document",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Video => "video",
            Modality::Text => "text",
            Modality::Other(name) => name,
        }
    }
}

impl Default for Modality {
    fn default() -> Self {
        Modality::Text
    }
}

impl From<String> for Modality {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "conversation" => Modality::Conversation,
            "document" => Modality::Document,
            "image" => Modality::Image,
            "audio" => Modality::Audio,
            "video" => Modality::Video,
            "text" => Modality::Text,
            other => Modality::Other(other.to_string()),
        }
    }
}

impl From<Modality> for String {
    fn from(value: Modality) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an extracted memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Durable facts about the user themself
    Profile,
    /// Things that happened at a point in time
    Event,
    /// Facts and learned information
    Knowledge,
    /// Habits and behavioral patterns
    Behavior,
    /// Abilities and competencies
    Skill,
}

impl MemoryType {
    /// All memory types, in default extraction order.
    pub const ALL: [MemoryType; 5] = [
        MemoryType::Profile,
        MemoryType::Event,
        MemoryType::Knowledge,
        MemoryType::Behavior,
        MemoryType::Skill,
    ];

    /// Stable lowercase name used in config keys and storage rows.
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Profile => "profile",
            MemoryType::Event => "event",
            MemoryType::Knowledge => "knowledge",
            MemoryType::Behavior => "behavior",
            MemoryType::Skill => "skill",
        }
    }

    /// Root tag the extraction prompt asks the model to emit for this type.
    pub fn xml_root_tag(self) -> &'static str {
        match self {
            MemoryType::Profile => "profile",
            MemoryType::Event => "events",
            MemoryType::Knowledge => "knowledge",
            MemoryType::Behavior => "behaviors",
            MemoryType::Skill => "skills",
        }
    }

    /// Parse a lowercase memory-type name.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "profile" => Ok(MemoryType::Profile),
            "event" => Ok(MemoryType::Event),
            "knowledge" => Ok(MemoryType::Knowledge),
            "behavior" => Ok(MemoryType::Behavior),
            "skill" => Ok(MemoryType::Skill),
            other => Err(Error::InvalidInput(format!("unknown memory type: {other}"))),
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranking strategy for item vector search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingStrategy {
    /// Pure cosine similarity
    #[default]
    Similarity,
    /// Similarity weighted by reinforcement and recency decay
    Salience,
}

/// How the retrieve pipeline ranks candidates at each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveMethod {
    /// Cosine vector search against stored embeddings
    #[default]
    Rag,
    /// LLM call returning ids ordered by relevance
    Llm,
}

// ============================================================================
// Scope
// ============================================================================

/// User scope: the equality-filterable fields attached to every record.
///
/// Every write carries the scope of its creator; every read takes an
/// optional scope filter matched field-by-field. The engine never shares
/// records across scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(BTreeMap<String, String>);

impl Scope {
    /// An empty scope (matches everything when used as a filter).
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Convenience constructor for the common single-field scope.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        let mut scope = Self::new();
        scope.0.insert("user_id".to_string(), user_id.into());
        scope
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Look up a scope field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Iterate fields in stable (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every field of `filter` is present with an equal value.
    ///
    /// An empty filter matches every scope.
    pub fn matches(&self, filter: &Scope) -> bool {
        filter
            .0
            .iter()
            .all(|(field, value)| self.0.get(field) == Some(value))
    }

    /// Reject filters that mention fields outside the configured scope model.
    pub fn validate_fields(&self, allowed: &[String]) -> Result<()> {
        for field in self.0.keys() {
            if !allowed.iter().any(|a| a == field) {
                return Err(Error::InvalidInput(format!(
                    "unknown filter field '{field}' for current user scope"
                )));
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Scope {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ============================================================================
// Content hashing and reference ids
// ============================================================================

/// Compute the deduplication hash for a memory summary.
///
/// Operates on post-summary content: lowercases, trims, and collapses runs
/// of whitespace so that "I love coffee" and "I  love  coffee" hash alike,
/// then hashes `memory_type:normalized` and truncates to 16 hex chars.
pub fn compute_content_hash(summary: &str, memory_type: MemoryType) -> String {
    let normalized = summary
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(memory_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Short citation id for an item: first six chars of the dash-stripped UUID.
pub fn short_ref_id(id: Uuid) -> String {
    id.simple().to_string()[..6].to_string()
}

// ============================================================================
// Records
// ============================================================================

/// An ingested artifact (conversation, document, image, audio, video).
///
/// Append-only after creation except for the caption fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    /// Source URL the resource was fetched from
    pub url: String,
    pub modality: Modality,
    /// Local filesystem path after ingest
    pub local_path: String,
    /// Short natural-language summary, when preprocessing produced one
    pub caption: Option<String>,
    /// Embedding of the caption; always stored together with the caption
    pub caption_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
}

/// Keys the engine maintains inside [`MemoryItem::extra`].
pub mod extra_keys {
    /// 16-hex-char truncated SHA-256 used for deduplication
    pub const CONTENT_HASH: &str = "content_hash";
    /// Number of times this memory was reinforced (>= 1)
    pub const REINFORCEMENT_COUNT: &str = "reinforcement_count";
    /// ISO-8601 UTC timestamp of the last reinforcement
    pub const LAST_REINFORCED_AT: &str = "last_reinforced_at";
    /// Short id present once the item has been cited in a category summary
    pub const REF_ID: &str = "ref_id";
}

/// A single atomic memory extracted from a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: Uuid,
    /// Owning resource, when the item came from one
    pub resource_id: Option<Uuid>,
    pub memory_type: MemoryType,
    /// The memory text itself
    pub summary: String,
    /// Embedding of the summary
    pub embedding: Vec<f32>,
    /// When the remembered fact happened, if known
    pub happened_at: Option<DateTime<Utc>>,
    /// Open map; known keys are in [`extra_keys`]
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
}

impl MemoryItem {
    /// The deduplication hash, when present.
    pub fn content_hash(&self) -> Option<&str> {
        self.extra.get(extra_keys::CONTENT_HASH).and_then(Value::as_str)
    }

    /// Reinforcement count; items predating reinforcement tracking count as 1.
    pub fn reinforcement_count(&self) -> u64 {
        self.extra
            .get(extra_keys::REINFORCEMENT_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(1)
    }

    /// Parse `last_reinforced_at` from its stored ISO-8601 form.
    pub fn last_reinforced_at(&self) -> Option<DateTime<Utc>> {
        self.extra
            .get(extra_keys::LAST_REINFORCED_AT)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Short citation id, present only if the item has ever been cited.
    pub fn ref_id(&self) -> Option<&str> {
        self.extra.get(extra_keys::REF_ID).and_then(Value::as_str)
    }
}

/// A semantic bucket configured at service init.
///
/// Only the running `summary` changes over the category's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCategory {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Embedding of `name + ": " + description`
    pub embedding: Vec<f32>,
    /// Model-maintained markdown narrative; may carry `[ref:...]` citations
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
}

/// Many-to-many link between a category and a memory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryItem {
    pub id: Uuid,
    pub item_id: Uuid,
    pub category_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: Scope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_collapses_whitespace_and_case() {
        let a = compute_content_hash("I love coffee", MemoryType::Profile);
        let b = compute_content_hash("  i  LOVE   coffee ", MemoryType::Profile);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_hash_distinguishes_memory_types() {
        let a = compute_content_hash("I love coffee", MemoryType::Profile);
        let b = compute_content_hash("I love coffee", MemoryType::Event);
        assert_ne!(a, b);
    }

    #[test]
    fn short_ref_id_strips_dashes() {
        let id = Uuid::parse_str("a1b2c3d4-e5f6-7890-abcd-ef0123456789").unwrap();
        assert_eq!(short_ref_id(id), "a1b2c3");
    }

    #[test]
    fn modality_round_trips_unknown_values() {
        let m = Modality::from("screencast".to_string());
        assert_eq!(m, Modality::Other("screencast".to_string()));
        assert_eq!(m.as_str(), "screencast");
        assert!(!m.requires_text());
    }

    #[test]
    fn scope_filter_matches_subset() {
        let scope = Scope::for_user("u1").with("agent_id", "a1");
        assert!(scope.matches(&Scope::new()));
        assert!(scope.matches(&Scope::for_user("u1")));
        assert!(!scope.matches(&Scope::for_user("u2")));
        assert!(!scope.matches(&Scope::new().with("session_id", "s1")));
    }

    #[test]
    fn scope_rejects_unknown_filter_fields() {
        let filter = Scope::new().with("tenant", "t1");
        let allowed = vec!["user_id".to_string(), "agent_id".to_string()];
        assert!(filter.validate_fields(&allowed).is_err());
    }

    #[test]
    fn item_extra_accessors_default_sensibly() {
        let item = MemoryItem {
            id: Uuid::new_v4(),
            resource_id: None,
            memory_type: MemoryType::Profile,
            summary: "test".to_string(),
            embedding: vec![],
            happened_at: None,
            extra: Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            scope: Scope::new(),
        };
        assert_eq!(item.reinforcement_count(), 1);
        assert!(item.last_reinforced_at().is_none());
        assert!(item.ref_id().is_none());
        assert!(item.content_hash().is_none());
    }
}
