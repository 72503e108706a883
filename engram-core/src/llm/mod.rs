//! LLM client abstraction and named profiles.
//!
//! The engine does not own the language model; it calls it through
//! [`LlmClient`]. Steps request a client by profile name (`default`,
//! `embedding`, or any user-defined profile) via their declared
//! capabilities, and the [`LlmRegistry`] resolves the name to a configured
//! client. The engine is provider-agnostic: anything speaking the
//! OpenAI-compatible HTTP surface works through [`OpenAiClient`], and tests
//! plug in scripted clients.

pub mod openai;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use openai::OpenAiClient;

/// Operations the engine requires from a language-model provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Chat/summarize: one prompt in, generated text out.
    async fn summarize(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String>;

    /// Embed a batch of strings into fixed-dimensionality vectors.
    ///
    /// The output preserves input order and length.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vision: describe an image file given a prompt.
    async fn vision(
        &self,
        prompt: &str,
        image_path: &Path,
        system_prompt: Option<&str>,
    ) -> Result<String>;

    /// Transcribe an audio file to text.
    async fn transcribe(&self, audio_path: &Path) -> Result<String>;
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_transcribe_model() -> String {
    "whisper-1".to_string()
}

fn default_embed_batch_size() -> usize {
    16
}

/// One named LLM profile: provider endpoint plus model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProfile {
    /// Provider identifier; switches endpoint defaults (e.g. `grok`)
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    /// Embedding model used for vectorization
    pub embed_model: String,
    /// Transcription model for audio resources
    pub transcribe_model: String,
    /// Maximum batch size per embedding API call
    pub embed_batch_size: usize,
    /// Dimensionality the embedding model produces, when known up front
    /// (required by storage backends with native vector columns)
    pub embedding_dimensions: Option<usize>,
    /// Optional path overrides keyed by `chat` / `embeddings` /
    /// `transcriptions`
    pub endpoint_overrides: HashMap<String, String>,
}

impl Default for LlmProfile {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key: String::new(),
            chat_model: default_chat_model(),
            embed_model: default_embed_model(),
            transcribe_model: default_transcribe_model(),
            embed_batch_size: default_embed_batch_size(),
            embedding_dimensions: None,
            endpoint_overrides: HashMap::new(),
        }
    }
}

impl LlmProfile {
    /// Apply provider-specific endpoint defaults where the generic OpenAI
    /// defaults were left in place.
    #[must_use]
    pub fn with_provider_defaults(mut self) -> Self {
        if self.provider == "grok" {
            if self.base_url == default_base_url() {
                self.base_url = "https://api.x.ai/v1".to_string();
            }
            if self.chat_model == default_chat_model() {
                self.chat_model = "grok-2-latest".to_string();
            }
        }
        self
    }
}

/// Named LLM profiles with `default`/`embedding` fallback wiring.
///
/// A missing `embedding` profile aliases `default`, so configurations that
/// only define one provider still satisfy steps that request the embedding
/// capability.
pub struct LlmRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    profiles: HashMap<String, LlmProfile>,
}

impl std::fmt::Debug for LlmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRegistry")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LlmRegistry {
    /// Build a registry of [`OpenAiClient`]s from profile configs.
    pub fn from_profiles(mut profiles: HashMap<String, LlmProfile>) -> Result<Self> {
        if !profiles.contains_key("default") {
            profiles.insert("default".to_string(), LlmProfile::default());
        }
        if !profiles.contains_key("embedding") {
            let default = profiles
                .get("default")
                .cloned()
                .unwrap_or_default();
            profiles.insert("embedding".to_string(), default);
        }
        let mut clients: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();
        for (name, profile) in &profiles {
            let profile = profile.clone().with_provider_defaults();
            clients.insert(name.clone(), Arc::new(OpenAiClient::new(profile)?));
        }
        Ok(Self { clients, profiles })
    }

    /// Build a registry from pre-constructed clients (tests use this to
    /// inject scripted clients).
    pub fn from_clients(clients: HashMap<String, Arc<dyn LlmClient>>) -> Self {
        Self {
            clients,
            profiles: HashMap::new(),
        }
    }

    /// Resolve a profile name to its client, falling back to `default`.
    pub fn client(&self, profile: &str) -> Result<Arc<dyn LlmClient>> {
        if let Some(client) = self.clients.get(profile) {
            return Ok(Arc::clone(client));
        }
        self.clients
            .get("default")
            .map(Arc::clone)
            .ok_or_else(|| Error::InvalidConfig(format!("no LLM profile named '{profile}' and no default")))
    }

    /// The configured profile definition, when built from configs.
    pub fn profile(&self, name: &str) -> Option<&LlmProfile> {
        self.profiles.get(name).or_else(|| self.profiles.get("default"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grok_provider_switches_defaults() {
        let profile = LlmProfile {
            provider: "grok".to_string(),
            ..LlmProfile::default()
        }
        .with_provider_defaults();
        assert_eq!(profile.base_url, "https://api.x.ai/v1");
        assert_eq!(profile.chat_model, "grok-2-latest");
    }

    #[test]
    fn grok_provider_keeps_explicit_overrides() {
        let profile = LlmProfile {
            provider: "grok".to_string(),
            base_url: "http://localhost:8080/v1".to_string(),
            ..LlmProfile::default()
        }
        .with_provider_defaults();
        assert_eq!(profile.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn registry_aliases_embedding_to_default() {
        let registry =
            LlmRegistry::from_profiles(HashMap::from([("default".to_string(), LlmProfile::default())]))
                .unwrap();
        assert!(registry.client("embedding").is_ok());
        assert!(registry.client("missing-profile").is_ok());
    }
}
