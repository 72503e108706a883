//! Service configuration: database backend selection, LLM profiles,
//! category definitions, prompt overrides, and pipeline toggles.
//!
//! Everything deserializes with `serde` and carries defaults, so a minimal
//! configuration is an empty document; [`ServiceConfig::from_toml_str`]
//! loads the conventional TOML file form.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::LlmProfile;
use crate::prompts::PromptConfig;
use crate::types::{MemoryType, RankingStrategy, RetrieveMethod};

/// One configured memory category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Per-category override of the summary target length
    #[serde(default)]
    pub target_length: Option<usize>,
    /// Per-category override of the summary prompt
    #[serde(default)]
    pub summary_prompt: Option<PromptConfig>,
}

impl CategoryConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            target_length: None,
            summary_prompt: None,
        }
    }

    /// The text embedded for this category: `name: description`.
    pub fn embedding_text(&self) -> String {
        let name = self.name.trim();
        let name = if name.is_empty() { "Untitled" } else { name };
        let description = self.description.trim();
        if description.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {description}")
        }
    }
}

/// The stock category set used when the caller configures none.
pub fn default_memory_categories() -> Vec<CategoryConfig> {
    [
        ("personal_info", "Personal information about the user"),
        ("preferences", "User preferences, likes and dislikes"),
        ("relationships", "Information about relationships with others"),
        ("activities", "Activities, hobbies, and interests"),
        ("goals", "Goals, aspirations, and objectives"),
        ("experiences", "Past experiences and events"),
        ("knowledge", "Knowledge, facts, and learned information"),
        ("opinions", "Opinions, viewpoints, and perspectives"),
        ("habits", "Habits, routines, and patterns"),
        ("work_life", "Work-related information and professional life"),
    ]
    .into_iter()
    .map(|(name, description)| CategoryConfig::new(name, description))
    .collect()
}

fn default_memory_types() -> Vec<String> {
    MemoryType::ALL.iter().map(|t| t.as_str().to_string()).collect()
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_target_length() -> usize {
    400
}

fn default_category_assign_threshold() -> f32 {
    0.25
}

/// Memorize pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorizeConfig {
    /// Minimum similarity for auto-assigning categories (reserved for
    /// embedding-based assignment)
    pub category_assign_threshold: f32,
    /// Preprocess prompt overrides keyed by modality name
    pub multimodal_preprocess_prompts: HashMap<String, PromptConfig>,
    pub preprocess_llm_profile: String,
    /// Whitelist of memory types to extract, in extraction order
    pub memory_types: Vec<String>,
    /// Extraction prompt overrides keyed by memory-type name
    pub memory_type_prompts: HashMap<String, PromptConfig>,
    pub memory_extract_llm_profile: String,
    /// Category definitions embedded at service startup
    pub memory_categories: Vec<CategoryConfig>,
    /// Default summary prompt for categories without their own
    pub default_category_summary_prompt: Option<PromptConfig>,
    /// Target max length for generated category summaries
    pub default_category_summary_target_length: usize,
    pub category_update_llm_profile: String,
    /// Inline `[ref:ID]` citations in category summaries
    pub enable_item_references: bool,
    /// Content-hash deduplication with reinforcement counters
    pub enable_item_reinforcement: bool,
}

impl Default for MemorizeConfig {
    fn default() -> Self {
        Self {
            category_assign_threshold: default_category_assign_threshold(),
            multimodal_preprocess_prompts: HashMap::new(),
            preprocess_llm_profile: default_profile_name(),
            memory_types: default_memory_types(),
            memory_type_prompts: HashMap::new(),
            memory_extract_llm_profile: default_profile_name(),
            memory_categories: default_memory_categories(),
            default_category_summary_prompt: None,
            default_category_summary_target_length: default_target_length(),
            category_update_llm_profile: default_profile_name(),
            enable_item_references: false,
            enable_item_reinforcement: false,
        }
    }
}

impl MemorizeConfig {
    /// Parse and validate the configured memory-type whitelist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on unknown type names.
    pub fn resolve_memory_types(&self) -> Result<Vec<MemoryType>> {
        self.memory_types
            .iter()
            .map(|name| {
                MemoryType::parse(name)
                    .map_err(|_| Error::InvalidConfig(format!("unknown memory type '{name}'")))
            })
            .collect()
    }
}

/// Category-tier retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveCategoryConfig {
    pub enabled: bool,
    pub top_k: usize,
}

impl Default for RetrieveCategoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
        }
    }
}

/// Item-tier retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveItemConfig {
    pub enabled: bool,
    pub top_k: usize,
    /// Restrict the item pool to `[ref:ID]` citations found in the chosen
    /// category summaries
    pub use_category_references: bool,
    pub ranking: RankingStrategy,
    /// Half-life in days for salience recency decay
    pub recency_decay_days: f64,
}

impl Default for RetrieveItemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            use_category_references: false,
            ranking: RankingStrategy::Similarity,
            recency_decay_days: 30.0,
        }
    }
}

/// Resource-tier retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveResourceConfig {
    pub enabled: bool,
    pub top_k: usize,
}

impl Default for RetrieveResourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
        }
    }
}

/// Retrieve pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    pub method: RetrieveMethod,
    /// Run the pre-retrieval decision (needs retrieval? rewrite query?)
    pub route_intention: bool,
    pub category: RetrieveCategoryConfig,
    pub item: RetrieveItemConfig,
    pub resource: RetrieveResourceConfig,
    /// Run a sufficiency check after each tier
    pub sufficiency_check: bool,
    /// Override of the sufficiency-check user prompt
    pub sufficiency_check_prompt: Option<PromptConfig>,
    pub sufficiency_check_llm_profile: String,
    pub llm_ranking_llm_profile: String,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            method: RetrieveMethod::Rag,
            route_intention: true,
            category: RetrieveCategoryConfig::default(),
            item: RetrieveItemConfig::default(),
            resource: RetrieveResourceConfig::default(),
            sufficiency_check: true,
            sufficiency_check_prompt: None,
            sufficiency_check_llm_profile: default_profile_name(),
            llm_ranking_llm_profile: default_profile_name(),
        }
    }
}

/// Metadata-store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseProvider {
    /// Keyed in-process maps with linear scans
    #[default]
    Inmemory,
    /// Relational backend serving similarity queries natively
    RelationalWithNativeVectors,
    /// Relational backend with in-process vector scans
    RelationalWithout,
}

/// Database backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub provider: DatabaseProvider,
    /// Connection string; required for the relational providers
    pub dsn: Option<String>,
}

/// Blob fetcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub resources_dir: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            resources_dir: "./data/resources".to_string(),
        }
    }
}

fn default_scope_fields() -> Vec<String> {
    vec!["user_id".to_string()]
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    /// Named LLM profiles; `default` and `embedding` are filled in when
    /// absent
    pub llm_profiles: HashMap<String, LlmProfile>,
    pub memorize: MemorizeConfig,
    pub retrieve: RetrieveConfig,
    pub blob: BlobConfig,
    /// Scope fields every record carries; filters may only name these
    pub scope_fields: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            llm_profiles: HashMap::new(),
            memorize: MemorizeConfig::default(),
            retrieve: RetrieveConfig::default(),
            blob: BlobConfig::default(),
            scope_fields: default_scope_fields(),
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on malformed TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::InvalidConfig(format!("bad config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config.database.provider, DatabaseProvider::Inmemory);
        assert_eq!(config.scope_fields, vec!["user_id".to_string()]);
        assert_eq!(config.memorize.memory_categories.len(), 10);
        assert!(config.retrieve.route_intention);
        assert_eq!(config.retrieve.item.recency_decay_days, 30.0);
    }

    #[test]
    fn toml_overrides_nested_fields() {
        let config = ServiceConfig::from_toml_str(
            r#"
            scope_fields = ["user_id", "agent_id"]

            [database]
            provider = "relational-without"
            dsn = "file:/tmp/engram.db"

            [memorize]
            memory_types = ["profile", "event"]
            enable_item_reinforcement = true

            [retrieve]
            method = "llm"

            [retrieve.item]
            ranking = "salience"
            use_category_references = true
            "#,
        )
        .unwrap();
        assert_eq!(config.database.provider, DatabaseProvider::RelationalWithout);
        assert_eq!(
            config.memorize.resolve_memory_types().unwrap(),
            vec![MemoryType::Profile, MemoryType::Event]
        );
        assert!(config.memorize.enable_item_reinforcement);
        assert_eq!(config.retrieve.method, RetrieveMethod::Llm);
        assert_eq!(config.retrieve.item.ranking, RankingStrategy::Salience);
        assert!(config.retrieve.item.use_category_references);
    }

    #[test]
    fn unknown_memory_type_is_rejected() {
        let config = MemorizeConfig {
            memory_types: vec!["profile".to_string(), "feeling".to_string()],
            ..MemorizeConfig::default()
        };
        assert!(config.resolve_memory_types().is_err());
    }

    #[test]
    fn category_embedding_text_joins_name_and_description() {
        let category = CategoryConfig::new("habits", "Routines and patterns");
        assert_eq!(category.embedding_text(), "habits: Routines and patterns");
        let bare = CategoryConfig::new("habits", "");
        assert_eq!(bare.embedding_text(), "habits");
    }
}
