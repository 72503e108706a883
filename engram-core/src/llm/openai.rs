//! OpenAI-compatible HTTP client for chat, embeddings, vision, and
//! transcription.
//!
//! Works against any provider speaking the OpenAI surface (OpenAI, Azure,
//! Grok, local gateways) via the profile's `base_url` and optional endpoint
//! overrides.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

use super::{LlmClient, LlmProfile};

/// LLM client over the OpenAI-compatible REST API.
pub struct OpenAiClient {
    profile: LlmProfile,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.profile.base_url)
            .field("chat_model", &self.profile.chat_model)
            .field("embed_model", &self.profile.embed_model)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiClient {
    /// Build a client for one profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Llm`] when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(profile: LlmProfile) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Llm(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { profile, client })
    }

    fn endpoint(&self, kind: &str, default_path: &str) -> String {
        if let Some(overridden) = self.profile.endpoint_overrides.get(kind) {
            return overridden.clone();
        }
        format!("{}/{}", self.profile.base_url.trim_end_matches('/'), default_path)
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let url = self.endpoint("chat", "chat/completions");
        let request = ChatRequest {
            model: &self.profile.chat_model,
            messages,
        };
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.profile.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("chat API error {status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("failed to parse chat response: {e}")))?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            model = %self.profile.chat_model,
            "chat completion finished"
        );
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Llm("chat API returned no choices".to_string()))
    }

    fn image_data_url(image_path: &Path) -> Result<String> {
        let bytes = std::fs::read(image_path)?;
        let mime = match image_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{mime};base64,{encoded}"))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn summarize(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: serde_json::Value::String(system.to_string()),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: serde_json::Value::String(prompt.to_string()),
        });
        self.chat(messages).await
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint("embeddings", "embeddings");
        let batch_size = self.profile.embed_batch_size.max(1);
        let mut embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(batch_size) {
            let request = EmbeddingRequest {
                model: &self.profile.embed_model,
                input: chunk,
                encoding_format: "float",
            };
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.profile.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| Error::Llm(format!("embedding request failed: {e}")))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Llm(format!("embedding API error {status}: {body}")));
            }

            let parsed: EmbeddingResponse = response
                .json()
                .await
                .map_err(|e| Error::Llm(format!("failed to parse embedding response: {e}")))?;
            if parsed.data.len() != chunk.len() {
                return Err(Error::Llm(format!(
                    "embedding API returned {} vectors for {} inputs",
                    parsed.data.len(),
                    chunk.len()
                )));
            }
            let mut data = parsed.data;
            data.sort_by_key(|d| d.index);
            embeddings.extend(data.into_iter().map(|d| d.embedding));
        }

        debug!(count = embeddings.len(), model = %self.profile.embed_model, "generated embeddings");
        Ok(embeddings)
    }

    async fn vision(
        &self,
        prompt: &str,
        image_path: &Path,
        system_prompt: Option<&str>,
    ) -> Result<String> {
        let data_url = Self::image_data_url(image_path)?;
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: serde_json::Value::String(system.to_string()),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: serde_json::json!([
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": data_url}},
            ]),
        });
        self.chat(messages).await
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<String> {
        let url = self.endpoint("transcriptions", "audio/transcriptions");
        let bytes = tokio::fs::read(audio_path).await?;
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("model", self.profile.transcribe_model.clone())
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.profile.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("transcription request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("transcription API error {status}: {body}")));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("failed to parse transcription response: {e}")))?;
        Ok(parsed.text)
    }
}
