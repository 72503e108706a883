//! # Test Utilities
//!
//! Shared test utilities for the memory engine.
//!
//! Provides:
//! - A scripted [`MockLlm`] client with rule-based chat responses and
//!   deterministic embeddings
//! - Service builders wiring the mock into an in-memory backend
//! - Fixture writers for conversation and document resources

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use engram_core::config::ServiceConfig;
use engram_core::llm::{LlmClient, LlmRegistry};
use engram_core::service::MemoryService;
use engram_core::{Error, Result};

/// A recorded LLM call, for assertions on pipeline behavior.
#[derive(Debug, Clone)]
pub enum RecordedCall {
    Chat {
        prompt: String,
        system_prompt: Option<String>,
    },
    Embed {
        texts: Vec<String>,
    },
    Vision {
        prompt: String,
        image_path: PathBuf,
    },
    Transcribe {
        audio_path: PathBuf,
    },
}

type DynamicResponder = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
enum ChatResponse {
    Static(String),
    /// Computed from the prompt, for responses that must echo ids the
    /// pipeline generated at runtime (e.g. `[ref:...]` citations).
    Dynamic(DynamicResponder),
}

#[derive(Clone)]
struct ChatRule {
    needle: String,
    response: ChatResponse,
}

/// Scripted LLM client.
///
/// Chat responses are selected by the first rule whose needle appears in
/// the prompt (rules are checked in insertion order), falling back to a
/// default. Embeddings are deterministic functions of the input text, so
/// identical texts always land on identical vectors; specific texts can be
/// pinned to specific vectors for ranking tests.
pub struct MockLlm {
    rules: Mutex<Vec<ChatRule>>,
    default_chat: Mutex<String>,
    pinned_embeddings: Mutex<HashMap<String, Vec<f32>>>,
    embed_dim: usize,
    vision_response: Mutex<Option<String>>,
    transcription: Mutex<Option<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default_chat: Mutex::new(String::new()),
            pinned_embeddings: Mutex::new(HashMap::new()),
            embed_dim: 8,
            vision_response: Mutex::new(None),
            transcription: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Respond with `response` whenever `needle` appears in the prompt.
    #[must_use]
    pub fn respond_when(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.lock().push(ChatRule {
            needle: needle.into(),
            response: ChatResponse::Static(response.into()),
        });
        self
    }

    /// Compute the response from the prompt whenever `needle` matches.
    #[must_use]
    pub fn respond_when_fn(
        self,
        needle: impl Into<String>,
        responder: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.rules.lock().push(ChatRule {
            needle: needle.into(),
            response: ChatResponse::Dynamic(Arc::new(responder)),
        });
        self
    }

    /// Response for prompts no rule matches.
    #[must_use]
    pub fn with_default_response(self, response: impl Into<String>) -> Self {
        *self.default_chat.lock() = response.into();
        self
    }

    /// Pin the embedding returned for an exact text.
    #[must_use]
    pub fn with_pinned_embedding(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.pinned_embeddings.lock().insert(text.into(), vector);
        self
    }

    #[must_use]
    pub fn with_vision_response(self, response: impl Into<String>) -> Self {
        *self.vision_response.lock() = Some(response.into());
        self
    }

    #[must_use]
    pub fn with_transcription(self, text: impl Into<String>) -> Self {
        *self.transcription.lock() = Some(text.into());
        self
    }

    /// Everything the pipelines asked this client, in call order.
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Chat prompts only, in call order.
    pub fn chat_prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Chat { prompt, .. } => Some(prompt.clone()),
                _ => None,
            })
            .collect()
    }

    fn select_response(&self, prompt: &str) -> String {
        for rule in self.rules.lock().iter() {
            if prompt.contains(&rule.needle) {
                return match &rule.response {
                    ChatResponse::Static(response) => response.clone(),
                    ChatResponse::Dynamic(responder) => responder(prompt),
                };
            }
        }
        self.default_chat.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn summarize(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        self.calls.lock().push(RecordedCall::Chat {
            prompt: prompt.to_string(),
            system_prompt: system_prompt.map(str::to_string),
        });
        Ok(self.select_response(prompt))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.lock().push(RecordedCall::Embed {
            texts: texts.to_vec(),
        });
        let pinned = self.pinned_embeddings.lock();
        Ok(texts
            .iter()
            .map(|text| {
                pinned
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| deterministic_embedding(text, self.embed_dim))
            })
            .collect())
    }

    async fn vision(
        &self,
        prompt: &str,
        image_path: &Path,
        _system_prompt: Option<&str>,
    ) -> Result<String> {
        self.calls.lock().push(RecordedCall::Vision {
            prompt: prompt.to_string(),
            image_path: image_path.to_path_buf(),
        });
        self.vision_response
            .lock()
            .clone()
            .ok_or_else(|| Error::Llm("mock has no vision response".to_string()))
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<String> {
        self.calls.lock().push(RecordedCall::Transcribe {
            audio_path: audio_path.to_path_buf(),
        });
        self.transcription
            .lock()
            .clone()
            .ok_or_else(|| Error::Llm("mock has no transcription".to_string()))
    }
}

/// Install a test-friendly tracing subscriber once; repeat calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Deterministic pseudo-embedding: unit vector derived from a hash of the
/// text. Identical texts embed identically; distinct texts almost surely
/// differ.
pub fn deterministic_embedding(text: &str, dim: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut vector: Vec<f32> = digest
        .iter()
        .cycle()
        .take(dim)
        .map(|b| f32::from(*b) / 255.0 + 0.01)
        .collect();
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    for value in &mut vector {
        *value /= norm;
    }
    vector
}

/// Build a service over the in-memory backend with the same mock serving
/// every LLM profile.
pub fn service_with_mock(config: ServiceConfig, mock: Arc<MockLlm>) -> MemoryService {
    init_tracing();
    let client: Arc<dyn LlmClient> = mock;
    let registry = LlmRegistry::from_clients(HashMap::from([
        ("default".to_string(), Arc::clone(&client)),
        ("embedding".to_string(), client),
    ]));
    #[allow(clippy::expect_used)]
    MemoryService::with_inmemory(config, Arc::new(registry)).expect("valid test config")
}

/// Write a fixture file under `dir` and return its absolute path as a URL
/// string for the blob fetcher.
pub fn write_fixture(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    #[allow(clippy::expect_used)]
    std::fs::write(&path, content).expect("write fixture");
    path.to_string_lossy().into_owned()
}

/// A three-topic conversation fixture: coffee preference, work, weekend
/// plans. Ten non-empty lines, indices 0-9 after preprocessing.
pub fn sample_conversation_json() -> String {
    serde_json::json!([
        {"role": "user", "content": "I start every day with two espressos."},
        {"role": "assistant", "content": "Noted, quite the coffee routine!"},
        {"role": "user", "content": "Yes, I love coffee more than anything."},
        {"role": "assistant", "content": "What do you do for work?"},
        {"role": "user", "content": "I'm a marine biologist at the aquarium."},
        {"role": "assistant", "content": "That sounds fascinating."},
        {"role": "user", "content": "This weekend I'm going diving again."},
        {"role": "assistant", "content": "Enjoy the dive!"},
        {"role": "user", "content": "Diving is my favorite hobby."},
        {"role": "assistant", "content": "Be safe out there."}
    ])
    .to_string()
}

/// Extraction XML for a single memory, parameterized by root tag, content,
/// and category.
pub fn extraction_xml(root: &str, content: &str, category: &str) -> String {
    format!(
        "<{root}><memory><content>{content}</content>\
         <categories><category>{category}</category></categories></memory></{root}>"
    )
}

/// An empty extraction response for a root tag.
pub fn empty_extraction_xml(root: &str) -> String {
    format!("<{root}></{root}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_embeddings_are_stable_and_unit_norm() {
        let a = deterministic_embedding("hello", 8);
        let b = deterministic_embedding("hello", 8);
        let c = deterministic_embedding("other", 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn rules_route_chat_responses() {
        let mock = MockLlm::new()
            .respond_when("alpha", "A")
            .respond_when("beta", "B")
            .with_default_response("D");
        assert_eq!(mock.summarize("contains alpha here", None).await.unwrap(), "A");
        assert_eq!(mock.summarize("beta prompt", None).await.unwrap(), "B");
        assert_eq!(mock.summarize("nothing", None).await.unwrap(), "D");
        assert_eq!(mock.chat_prompts().len(), 3);
    }
}
