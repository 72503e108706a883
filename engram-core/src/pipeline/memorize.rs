//! The memorize pipeline: ingest -> preprocess -> extract -> dedupe ->
//! categorize -> summarize -> respond.
//!
//! One invocation turns a resource URL into persisted resources, memory
//! items, category relations, and regenerated category summaries. Ordering
//! within an invocation is fixed: resources before their items, items
//! before their relations, summaries after all new items are linked, and
//! `ref_id` annotation after summaries. Concurrent invocations share the
//! storage substrate; category summaries follow last-writer-wins.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blob::LocalFs;
use crate::config::{CategoryConfig, MemorizeConfig};
use crate::conversation::format_conversation_for_preprocess;
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::prompts::{self, render_template, PromptConfig};
use crate::references::extract_references;
use crate::service::CategoryCatalog;
use crate::storage::{Database, NewMemoryItem, NewResource};
use crate::types::{
    extra_keys, short_ref_id, CategoryItem, MemoryItem, MemoryType, Modality, Resource, Scope,
};
use crate::video::FrameExtractor;
use crate::workflow::{Capability, StepClients, StepConfig, StepHandler, Workflow, WorkflowStep};

use super::{
    extract_json_blob, extract_tag_content, strip_code_fences, CategoryView, MemoryItemView,
    ResourceView,
};

const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "mp4", "mpeg", "mpga", "m4a", "wav", "webm"];
const TEXT_EXTENSIONS: [&str; 2] = ["txt", "text"];
const NO_NEW_ITEMS: &str = "No new memory items.";

/// Input to one memorize invocation.
#[derive(Debug, Clone)]
pub struct MemorizeRequest {
    pub resource_url: String,
    pub modality: Modality,
    /// Scope stamped onto every record this call creates
    pub user: Option<Scope>,
}

/// Output of one memorize invocation.
///
/// A single-segment run returns its resource under `resource`; multi-segment
/// runs (segmented conversations) return them under `resources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorizeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceView>,
    pub items: Vec<MemoryItemView>,
    pub categories: Vec<CategoryView>,
    pub relations: Vec<CategoryItem>,
}

/// One preprocessed segment: text to extract from plus an optional caption.
#[derive(Debug, Clone, Default)]
pub struct PreprocessedSegment {
    pub text: Option<String>,
    pub caption: Option<String>,
}

/// One extracted memory candidate before persistence.
#[derive(Debug, Clone)]
pub struct ExtractedEntry {
    pub memory_type: MemoryType,
    pub content: String,
    pub categories: Vec<String>,
}

/// Per-segment plan: the resource to create and the entries to persist.
#[derive(Debug, Clone)]
struct ResourcePlan {
    resource_url: String,
    caption: Option<String>,
    entries: Vec<ExtractedEntry>,
}

/// Typed workflow state for memorize.
#[derive(Debug, Default)]
pub struct MemorizeState {
    resource_url: String,
    modality: Modality,
    scope: Scope,
    memory_types: Vec<MemoryType>,
    local_path: Option<PathBuf>,
    raw_text: Option<String>,
    preprocessed: Vec<PreprocessedSegment>,
    plans: Vec<ResourcePlan>,
    resources: Vec<Resource>,
    items: Vec<MemoryItem>,
    relations: Vec<CategoryItem>,
    /// category id -> (item id, summary) for this run's new items
    category_updates: BTreeMap<Uuid, Vec<(Uuid, String)>>,
    updated_summaries: BTreeMap<Uuid, String>,
    response: Option<MemorizeResponse>,
}

impl MemorizeState {
    /// Summaries rewritten by this run, keyed by category id.
    pub fn updated_summaries(&self) -> &BTreeMap<Uuid, String> {
        &self.updated_summaries
    }
}

#[derive(Debug, Clone, Copy)]
enum MemorizeStepKind {
    Ingest,
    Preprocess,
    Extract,
    DedupeMerge,
    Categorize,
    PersistIndex,
    BuildResponse,
}

/// Dispatches one workflow step to its pipeline method.
struct MemorizeHandler {
    pipeline: Arc<MemorizePipeline>,
    kind: MemorizeStepKind,
}

#[async_trait]
impl StepHandler<MemorizeState> for MemorizeHandler {
    async fn run(&self, state: &mut MemorizeState, clients: StepClients) -> Result<()> {
        match self.kind {
            MemorizeStepKind::Ingest => self.pipeline.ingest_resource(state, clients).await,
            MemorizeStepKind::Preprocess => self.pipeline.preprocess_multimodal(state, clients).await,
            MemorizeStepKind::Extract => self.pipeline.extract_items(state, clients).await,
            MemorizeStepKind::DedupeMerge => self.pipeline.dedupe_merge(state, clients).await,
            MemorizeStepKind::Categorize => self.pipeline.categorize_items(state, clients).await,
            MemorizeStepKind::PersistIndex => self.pipeline.persist_and_index(state, clients).await,
            MemorizeStepKind::BuildResponse => self.pipeline.build_response(state, clients).await,
        }
    }
}

/// The memorize pipeline over one storage substrate and category catalog.
pub struct MemorizePipeline {
    db: Arc<dyn Database>,
    fs: LocalFs,
    config: MemorizeConfig,
    catalog: Arc<CategoryCatalog>,
    category_config_map: HashMap<String, CategoryConfig>,
}

impl std::fmt::Debug for MemorizePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorizePipeline")
            .field("categories", &self.catalog.category_ids.len())
            .finish_non_exhaustive()
    }
}

impl MemorizePipeline {
    pub fn new(
        db: Arc<dyn Database>,
        fs: LocalFs,
        config: MemorizeConfig,
        catalog: Arc<CategoryCatalog>,
    ) -> Self {
        let category_config_map = config
            .memory_categories
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect();
        Self {
            db,
            fs,
            config,
            catalog,
            category_config_map,
        }
    }

    /// Build the initial workflow state for a request.
    pub fn initial_state(
        &self,
        request: MemorizeRequest,
        memory_types: Vec<MemoryType>,
    ) -> MemorizeState {
        MemorizeState {
            resource_url: request.resource_url,
            modality: request.modality,
            scope: request.user.unwrap_or_default(),
            memory_types,
            ..MemorizeState::default()
        }
    }

    /// Take the response out of a finished state.
    pub fn take_response(state: &mut MemorizeState) -> Result<MemorizeResponse> {
        state
            .response
            .take()
            .ok_or_else(|| Error::Workflow("memorize workflow produced no response".to_string()))
    }

    /// The seven-step memorize workflow.
    pub fn workflow(self: &Arc<Self>) -> Result<Workflow<MemorizeState>> {
        let step = |id, role, requires, produces, capabilities, config, kind| WorkflowStep {
            id,
            role,
            requires,
            produces,
            capabilities,
            config,
            handler: Box::new(MemorizeHandler {
                pipeline: Arc::clone(self),
                kind,
            }) as Box<dyn StepHandler<MemorizeState>>,
        };

        let steps = vec![
            step(
                "ingest_resource",
                "ingest",
                &["resource_url", "modality"][..],
                &["local_path", "raw_text"][..],
                &[Capability::Io][..],
                StepConfig::default(),
                MemorizeStepKind::Ingest,
            ),
            step(
                "preprocess_multimodal",
                "preprocess",
                &["local_path", "modality", "raw_text"][..],
                &["preprocessed_segments"][..],
                &[Capability::Llm][..],
                StepConfig {
                    chat_llm_profile: Some(self.config.preprocess_llm_profile.clone()),
                    embed_llm_profile: None,
                },
                MemorizeStepKind::Preprocess,
            ),
            step(
                "extract_items",
                "extract",
                &["preprocessed_segments", "memory_types", "modality", "resource_url"][..],
                &["resource_plans"][..],
                &[Capability::Llm][..],
                StepConfig {
                    chat_llm_profile: Some(self.config.memory_extract_llm_profile.clone()),
                    embed_llm_profile: None,
                },
                MemorizeStepKind::Extract,
            ),
            step(
                "dedupe_merge",
                "dedupe_merge",
                &["resource_plans"][..],
                &["resource_plans"][..],
                &[][..],
                StepConfig::default(),
                MemorizeStepKind::DedupeMerge,
            ),
            step(
                "categorize_items",
                "categorize",
                &["resource_plans", "local_path", "modality", "scope"][..],
                &["resources", "items", "relations", "category_updates"][..],
                &[Capability::Db, Capability::Vector][..],
                StepConfig {
                    chat_llm_profile: None,
                    embed_llm_profile: Some("embedding".to_string()),
                },
                MemorizeStepKind::Categorize,
            ),
            step(
                "persist_index",
                "persist",
                &["category_updates"][..],
                &["updated_summaries"][..],
                &[Capability::Db, Capability::Llm][..],
                StepConfig {
                    chat_llm_profile: Some(self.config.category_update_llm_profile.clone()),
                    embed_llm_profile: None,
                },
                MemorizeStepKind::PersistIndex,
            ),
            step(
                "build_response",
                "emit",
                &["resources", "items", "relations"][..],
                &["response"][..],
                &[Capability::Db][..],
                StepConfig::default(),
                MemorizeStepKind::BuildResponse,
            ),
        ];

        Workflow::new(
            "memorize",
            &["resource_url", "modality", "memory_types", "scope"],
            steps,
        )
    }

    // ========================================================================
    // Step handlers
    // ========================================================================

    async fn ingest_resource(&self, state: &mut MemorizeState, _clients: StepClients) -> Result<()> {
        let (local_path, raw_text) = self.fs.fetch(&state.resource_url, &state.modality).await?;
        state.local_path = Some(local_path);
        state.raw_text = raw_text;
        Ok(())
    }

    async fn preprocess_multimodal(
        &self,
        state: &mut MemorizeState,
        clients: StepClients,
    ) -> Result<()> {
        let chat = clients.chat()?;
        let local_path = state
            .local_path
            .clone()
            .ok_or_else(|| Error::Workflow("preprocess ran before ingest".to_string()))?;
        let mut segments = self
            .preprocess_resource(&local_path, state.raw_text.clone(), &state.modality, &chat)
            .await?;
        if segments.is_empty() {
            segments = vec![PreprocessedSegment {
                text: state.raw_text.clone(),
                caption: None,
            }];
        }
        state.preprocessed = segments;
        Ok(())
    }

    async fn extract_items(&self, state: &mut MemorizeState, clients: StepClients) -> Result<()> {
        let chat = clients.chat()?;
        let total_segments = state.preprocessed.len().max(1);
        let mut plans = Vec::with_capacity(state.preprocessed.len());

        for (idx, segment) in state.preprocessed.iter().enumerate() {
            let resource_url = segment_resource_url(&state.resource_url, idx, total_segments);
            let entries = match &segment.text {
                Some(text) if !text.trim().is_empty() => {
                    self.generate_entries_from_text(text, &state.memory_types, &chat)
                        .await?
                }
                _ => Vec::new(),
            };
            plans.push(ResourcePlan {
                resource_url,
                caption: segment.caption.clone(),
                entries,
            });
        }

        state.plans = plans;
        Ok(())
    }

    /// Reserved within-batch dedup/merge hook.
    ///
    /// Intentionally a pass-through: the workflow contract keeps the slot
    /// for coalescing near-duplicate candidates before they reach storage.
    async fn dedupe_merge(&self, _state: &mut MemorizeState, _clients: StepClients) -> Result<()> {
        Ok(())
    }

    async fn categorize_items(
        &self,
        state: &mut MemorizeState,
        clients: StepClients,
    ) -> Result<()> {
        let embed = clients.embed()?;
        let local_path = state
            .local_path
            .clone()
            .ok_or_else(|| Error::Workflow("categorize ran before ingest".to_string()))?;
        let local_path = local_path.to_string_lossy().into_owned();
        let plans = std::mem::take(&mut state.plans);

        for plan in &plans {
            let resource = self
                .create_resource_with_caption(plan, &state.modality, &local_path, &state.scope, &embed)
                .await?;
            let resource_id = resource.id;
            state.resources.push(resource);

            if plan.entries.is_empty() {
                continue;
            }
            self.persist_memory_items(plan, resource_id, state, &embed)
                .await?;
        }

        state.plans = plans;
        Ok(())
    }

    async fn persist_and_index(
        &self,
        state: &mut MemorizeState,
        clients: StepClients,
    ) -> Result<()> {
        let chat = clients.chat()?;
        let updated = self
            .update_category_summaries(&state.category_updates, &chat)
            .await?;
        if self.config.enable_item_references {
            self.persist_item_references(&updated, &state.category_updates)
                .await?;
        }
        state.updated_summaries = updated;
        Ok(())
    }

    async fn build_response(&self, state: &mut MemorizeState, _clients: StepClients) -> Result<()> {
        let resources: Vec<ResourceView> = state
            .resources
            .iter()
            .map(|r| ResourceView::from_record(r, None))
            .collect();
        let items = state
            .items
            .iter()
            .map(|i| MemoryItemView::from_record(i, None))
            .collect();

        let mut categories = Vec::with_capacity(self.catalog.category_ids.len());
        for category_id in &self.catalog.category_ids {
            if let Some(category) = self.db.categories().get_category(*category_id).await? {
                categories.push(CategoryView::from_record(&category, None));
            }
        }

        let response = if resources.len() == 1 {
            MemorizeResponse {
                resource: resources.into_iter().next(),
                resources: Vec::new(),
                items,
                categories,
                relations: state.relations.clone(),
            }
        } else {
            MemorizeResponse {
                resource: None,
                resources,
                items,
                categories,
                relations: state.relations.clone(),
            }
        };
        state.response = Some(response);
        Ok(())
    }

    // ========================================================================
    // Preprocessing
    // ========================================================================

    fn resolve_preprocess_template(&self, modality: &Modality) -> Option<String> {
        match self.config.multimodal_preprocess_prompts.get(modality.as_str()) {
            // Custom block maps get no built-in defaults: an override must
            // provide all of its blocks.
            Some(config) => {
                let resolved = config.resolve(&[]);
                if resolved.trim().is_empty() {
                    None
                } else {
                    Some(resolved)
                }
            }
            None => prompts::preprocess::default_preprocess_prompt(modality).map(str::to_string),
        }
    }

    async fn preprocess_resource(
        &self,
        local_path: &std::path::Path,
        mut text: Option<String>,
        modality: &Modality,
        chat: &Arc<dyn LlmClient>,
    ) -> Result<Vec<PreprocessedSegment>> {
        let Some(template) = self.resolve_preprocess_template(modality) else {
            // No template configured: pass through as a single raw segment.
            // With no raw text either, there is nothing to memorize.
            if text.is_none() {
                return Err(Error::InvalidInput(format!(
                    "no preprocessing template for modality '{modality}' and no raw text"
                )));
            }
            return Ok(vec![PreprocessedSegment {
                text,
                caption: None,
            }]);
        };

        if matches!(modality, Modality::Audio) {
            text = self.prepare_audio_text(local_path, text, chat).await;
            if text.is_none() {
                return Ok(vec![PreprocessedSegment::default()]);
            }
        }

        if modality.requires_text() && text.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Ok(vec![PreprocessedSegment {
                text,
                caption: None,
            }]);
        }

        match (modality, text) {
            (Modality::Conversation, Some(text)) => {
                self.preprocess_conversation(&text, &template, chat).await
            }
            (Modality::Video, _) => Ok(self.preprocess_video(local_path, &template, chat).await),
            (Modality::Image, _) => self.preprocess_image(local_path, &template, chat).await,
            (Modality::Document, Some(text)) => {
                self.preprocess_text_resource(&text, &template, "document_text", chat)
                    .await
            }
            (Modality::Audio, Some(text)) => {
                self.preprocess_text_resource(&text, &template, "transcription", chat)
                    .await
            }
            (_, text) => Ok(vec![PreprocessedSegment {
                text,
                caption: None,
            }]),
        }
    }

    /// Ensure audio resources provide text, via transcription or file read.
    async fn prepare_audio_text(
        &self,
        local_path: &std::path::Path,
        text: Option<String>,
        chat: &Arc<dyn LlmClient>,
    ) -> Option<String> {
        if text.is_some() {
            return text;
        }
        let extension = local_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            match chat.transcribe(local_path).await {
                Ok(transcribed) => {
                    debug!(chars = transcribed.len(), "audio transcription completed");
                    Some(transcribed)
                }
                Err(e) => {
                    warn!(path = %local_path.display(), error = %e, "audio transcription failed");
                    None
                }
            }
        } else if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            match tokio::fs::read_to_string(local_path).await {
                Ok(content) => Some(content),
                Err(e) => {
                    warn!(path = %local_path.display(), error = %e, "failed to read transcript file");
                    None
                }
            }
        } else {
            warn!(extension, "unknown audio file type, skipping transcription");
            None
        }
    }

    /// Segment a conversation and caption each segment.
    ///
    /// The original indexed conversation stays authoritative for
    /// segmentation and extraction; the model's rewrite may drop fields and
    /// is only mined for the segments payload.
    async fn preprocess_conversation(
        &self,
        text: &str,
        template: &str,
        chat: &Arc<dyn LlmClient>,
    ) -> Result<Vec<PreprocessedSegment>> {
        let indexed = format_conversation_for_preprocess(text);
        let prompt = render_template(template, &[("conversation", &indexed)]);
        let processed = chat.summarize(&prompt, None).await?;

        let segments = parse_segments_payload(&processed);
        let Some(segments) = segments else {
            return Ok(vec![PreprocessedSegment {
                text: Some(indexed),
                caption: None,
            }]);
        };

        let max_index = max_line_index(&indexed);
        let mut out = Vec::new();
        for segment in &segments {
            let start = segment.start.clamp(0, max_index);
            let end = segment.end.clamp(0, max_index);
            let Some(segment_text) = extract_segment_text(&indexed, start, end) else {
                continue;
            };
            let caption = self.summarize_segment(&segment_text, chat).await;
            out.push(PreprocessedSegment {
                text: Some(segment_text),
                caption,
            });
        }

        if out.is_empty() {
            out.push(PreprocessedSegment {
                text: Some(indexed),
                caption: None,
            });
        }
        Ok(out)
    }

    async fn summarize_segment(
        &self,
        segment_text: &str,
        chat: &Arc<dyn LlmClient>,
    ) -> Option<String> {
        let prompt = format!(
            "Summarize the following conversation segment in 1-2 concise sentences.\n\
             Focus on the main topic or theme discussed.\n\n\
             Conversation:\n{segment_text}\n\nSummary:"
        );
        match chat.summarize(&prompt, None).await {
            Ok(response) => {
                let trimmed = response.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to summarize segment");
                None
            }
        }
    }

    /// Video: representative frame to the vision model.
    ///
    /// Any failure degrades to an empty segment; a missing frame extractor
    /// is not a caller error.
    async fn preprocess_video(
        &self,
        local_path: &std::path::Path,
        template: &str,
        chat: &Arc<dyn LlmClient>,
    ) -> Vec<PreprocessedSegment> {
        if !FrameExtractor::is_available().await {
            warn!("ffmpeg not available, cannot process video");
            return vec![PreprocessedSegment::default()];
        }

        let frame_path = match FrameExtractor::extract_middle_frame(local_path).await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "video frame extraction failed");
                return vec![PreprocessedSegment::default()];
            }
        };

        let result = chat.vision(template, &frame_path, None).await;
        if let Err(e) = tokio::fs::remove_file(&frame_path).await {
            debug!(frame = %frame_path.display(), error = %e, "failed to clean up frame");
        }

        match result {
            Ok(processed) => {
                let (description, caption) =
                    parse_multimodal_response(&processed, "detailed_description");
                vec![PreprocessedSegment {
                    text: description,
                    caption,
                }]
            }
            Err(e) => {
                warn!(error = %e, "video vision call failed");
                vec![PreprocessedSegment::default()]
            }
        }
    }

    async fn preprocess_image(
        &self,
        local_path: &std::path::Path,
        template: &str,
        chat: &Arc<dyn LlmClient>,
    ) -> Result<Vec<PreprocessedSegment>> {
        let processed = chat.vision(template, local_path, None).await?;
        let (description, caption) = parse_multimodal_response(&processed, "detailed_description");
        Ok(vec![PreprocessedSegment {
            text: description,
            caption,
        }])
    }

    async fn preprocess_text_resource(
        &self,
        text: &str,
        template: &str,
        slot: &str,
        chat: &Arc<dyn LlmClient>,
    ) -> Result<Vec<PreprocessedSegment>> {
        let prompt = render_template(template, &[(slot, text)]);
        let processed = chat.summarize(&prompt, None).await?;
        let (content, caption) = parse_multimodal_response(&processed, "processed_content");
        Ok(vec![PreprocessedSegment {
            text: content.or_else(|| Some(text.to_string())),
            caption,
        }])
    }

    // ========================================================================
    // Extraction
    // ========================================================================

    fn build_memory_type_prompt(&self, memory_type: MemoryType, resource_text: &str) -> String {
        let template = match self.config.memory_type_prompts.get(memory_type.as_str()) {
            Some(config) => {
                let defaults = prompts::memory_type::default_blocks(memory_type);
                let defaults: Vec<(&str, &str)> =
                    defaults.iter().map(|(n, t)| (*n, t.as_str())).collect();
                config.resolve(&defaults)
            }
            None => prompts::memory_type::default_prompt(memory_type),
        };
        if template.trim().is_empty() {
            return resource_text.to_string();
        }
        render_template(
            &template,
            &[
                ("resource", resource_text),
                ("categories_str", &self.catalog.prompt_listing),
            ],
        )
    }

    /// Fire one extraction call per memory type, concurrently, and parse.
    async fn generate_entries_from_text(
        &self,
        resource_text: &str,
        memory_types: &[MemoryType],
        chat: &Arc<dyn LlmClient>,
    ) -> Result<Vec<ExtractedEntry>> {
        if memory_types.is_empty() {
            return Ok(Vec::new());
        }
        let calls = memory_types.iter().map(|&memory_type| {
            let prompt = self.build_memory_type_prompt(memory_type, resource_text);
            let chat = Arc::clone(chat);
            async move { chat.summarize(&prompt, None).await }
        });
        let responses = try_join_all(calls).await?;

        let mut entries = Vec::new();
        for (&memory_type, response) in memory_types.iter().zip(responses.iter()) {
            for parsed in parse_memory_extraction_xml(response) {
                let content = parsed.content.trim().to_string();
                if content.is_empty() {
                    continue;
                }
                let categories = parsed
                    .categories
                    .into_iter()
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                entries.push(ExtractedEntry {
                    memory_type,
                    content,
                    categories,
                });
            }
        }
        Ok(entries)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn create_resource_with_caption(
        &self,
        plan: &ResourcePlan,
        modality: &Modality,
        local_path: &str,
        scope: &Scope,
        embed: &Arc<dyn LlmClient>,
    ) -> Result<Resource> {
        let caption = plan
            .caption
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let caption_embedding = match &caption {
            Some(caption) => {
                let mut vectors = embed.embed(std::slice::from_ref(caption)).await?;
                Some(vectors.pop().ok_or_else(|| {
                    Error::Llm("embedding API returned no vector for caption".to_string())
                })?)
            }
            None => None,
        };

        self.db
            .resources()
            .create_resource(NewResource {
                url: plan.resource_url.clone(),
                modality: modality.clone(),
                local_path: local_path.to_string(),
                caption,
                caption_embedding,
                scope: scope.clone(),
            })
            .await
    }

    async fn persist_memory_items(
        &self,
        plan: &ResourcePlan,
        resource_id: Uuid,
        state: &mut MemorizeState,
        embed: &Arc<dyn LlmClient>,
    ) -> Result<()> {
        let summaries: Vec<String> = plan.entries.iter().map(|e| e.content.clone()).collect();
        let embeddings = embed.embed(&summaries).await?;
        if embeddings.len() != plan.entries.len() {
            return Err(Error::Llm(format!(
                "embedding API returned {} vectors for {} summaries",
                embeddings.len(),
                plan.entries.len()
            )));
        }

        let reinforce = self.config.enable_item_reinforcement;
        for (entry, embedding) in plan.entries.iter().zip(embeddings) {
            let new_item = NewMemoryItem {
                resource_id: Some(resource_id),
                memory_type: entry.memory_type,
                summary: entry.content.clone(),
                embedding,
                happened_at: None,
                scope: state.scope.clone(),
            };

            let item = if reinforce {
                let outcome = self.db.items().create_item_reinforce(new_item).await?;
                state.items.push(outcome.item.clone());
                if outcome.reinforced {
                    // Reinforcement means we categorized this content before;
                    // relations stay untouched.
                    continue;
                }
                outcome.item
            } else {
                let item = self.db.items().create_item(new_item).await?;
                state.items.push(item.clone());
                item
            };

            for category_id in self.map_category_names(&entry.categories) {
                let relation = self
                    .db
                    .relations()
                    .link_item_category(item.id, category_id, state.scope.clone())
                    .await?;
                state.relations.push(relation);
                state
                    .category_updates
                    .entry(category_id)
                    .or_default()
                    .push((item.id, entry.content.clone()));
            }
        }
        Ok(())
    }

    /// Case-folded category name lookup; unknown names are dropped (the
    /// item stays persisted without a relation).
    fn map_category_names(&self, names: &[String]) -> Vec<Uuid> {
        let mut mapped = Vec::new();
        for name in names {
            let key = name.trim().to_lowercase();
            match self.catalog.name_to_id.get(&key) {
                Some(id) if !mapped.contains(id) => mapped.push(*id),
                Some(_) => {}
                None => warn!(category = %name, "extraction named an unconfigured category"),
            }
        }
        mapped
    }

    // ========================================================================
    // Category summaries and references
    // ========================================================================

    fn build_category_summary_prompt(
        &self,
        category: &crate::types::MemoryCategory,
        new_memories: &[(Uuid, String)],
    ) -> String {
        let with_refs = self.config.enable_item_references;
        let new_items_text = if with_refs {
            new_memories
                .iter()
                .filter(|(_, summary)| !summary.trim().is_empty())
                .map(|(item_id, summary)| format!("- [{}] {summary}", short_ref_id(*item_id)))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            new_memories
                .iter()
                .filter(|(_, summary)| !summary.trim().is_empty())
                .map(|(_, summary)| format!("- {summary}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let category_config = self.category_config_map.get(&category.name);
        let configured: Option<&PromptConfig> = category_config
            .and_then(|c| c.summary_prompt.as_ref())
            .or(self.config.default_category_summary_prompt.as_ref());

        let template = match configured {
            Some(config) => {
                let defaults = if with_refs {
                    prompts::category_summary::default_blocks_with_refs()
                } else {
                    prompts::category_summary::default_blocks()
                };
                let defaults: Vec<(&str, &str)> =
                    defaults.iter().map(|(n, t)| (*n, t.as_str())).collect();
                config.resolve(&defaults)
            }
            None if with_refs => prompts::category_summary::default_prompt_with_refs(),
            None => prompts::category_summary::default_prompt(),
        };

        let target_length = category_config
            .and_then(|c| c.target_length)
            .unwrap_or(self.config.default_category_summary_target_length);
        let original = category.summary.clone().unwrap_or_default();
        let items_text = if new_items_text.is_empty() {
            NO_NEW_ITEMS.to_string()
        } else {
            new_items_text
        };

        render_template(
            &template,
            &[
                ("category", category.name.as_str()),
                ("original_content", original.as_str()),
                ("new_memory_items_text", items_text.as_str()),
                ("target_length", target_length.to_string().as_str()),
            ],
        )
    }

    /// Regenerate summaries for every category that received new items,
    /// concurrently. Categories with no new items are never rewritten.
    async fn update_category_summaries(
        &self,
        updates: &BTreeMap<Uuid, Vec<(Uuid, String)>>,
        chat: &Arc<dyn LlmClient>,
    ) -> Result<BTreeMap<Uuid, String>> {
        let mut updated = BTreeMap::new();
        if updates.is_empty() {
            return Ok(updated);
        }

        let mut target_ids = Vec::new();
        let mut calls = Vec::new();
        for (category_id, memories) in updates {
            if memories.is_empty() {
                continue;
            }
            let Some(category) = self.db.categories().get_category(*category_id).await? else {
                continue;
            };
            let prompt = self.build_category_summary_prompt(&category, memories);
            let chat = Arc::clone(chat);
            target_ids.push(*category_id);
            calls.push(async move { chat.summarize(&prompt, None).await });
        }
        if calls.is_empty() {
            return Ok(updated);
        }

        let summaries = try_join_all(calls).await?;
        for (category_id, summary) in target_ids.into_iter().zip(summaries) {
            let cleaned = strip_code_fences(&summary);
            self.db
                .categories()
                .update_category_summary(category_id, &cleaned)
                .await?;
            updated.insert(category_id, cleaned);
        }
        Ok(updated)
    }

    /// Stamp `extra.ref_id` on every item whose short id is cited in an
    /// updated summary, so retrieval can follow citations later.
    async fn persist_item_references(
        &self,
        updated_summaries: &BTreeMap<Uuid, String>,
        category_updates: &BTreeMap<Uuid, Vec<(Uuid, String)>>,
    ) -> Result<()> {
        let mut referenced: Vec<String> = Vec::new();
        for summary in updated_summaries.values() {
            for reference in extract_references(summary) {
                if !referenced.contains(&reference) {
                    referenced.push(reference);
                }
            }
        }
        if referenced.is_empty() {
            return Ok(());
        }

        let mut short_to_item: HashMap<String, Uuid> = HashMap::new();
        for memories in category_updates.values() {
            for (item_id, _) in memories {
                short_to_item.insert(short_ref_id(*item_id), *item_id);
            }
        }

        for short_id in referenced {
            if let Some(item_id) = short_to_item.get(&short_id) {
                let mut entries = Map::new();
                entries.insert(extra_keys::REF_ID.to_string(), json!(short_id));
                self.db.items().update_item_extra(*item_id, entries).await?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Free parsing helpers
// ============================================================================

/// Segment descriptor parsed from the conversation-preprocess response.
#[derive(Debug, Clone, Deserialize)]
struct SegmentRange {
    start: i64,
    end: i64,
    #[serde(default)]
    #[allow(dead_code)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentsPayload {
    segments: Vec<SegmentRange>,
}

fn parse_segments_payload(raw: &str) -> Option<Vec<SegmentRange>> {
    let parse = |payload: &str| -> Option<Vec<SegmentRange>> {
        let parsed: SegmentsPayload = serde_json::from_str(payload).ok()?;
        if parsed.segments.is_empty() {
            None
        } else {
            Some(parsed.segments)
        }
    };
    parse(raw).or_else(|| extract_json_blob(raw).as_deref().and_then(parse))
}

/// Highest `[index]` marker present in the indexed conversation.
fn max_line_index(indexed: &str) -> i64 {
    indexed
        .lines()
        .filter_map(line_index)
        .max()
        .unwrap_or(0)
}

fn line_index(line: &str) -> Option<i64> {
    let rest = line.strip_prefix('[')?;
    let close = rest.find(']')?;
    rest[..close].parse().ok()
}

/// Keep the lines whose `[index]` marker falls inside `[start, end]`.
fn extract_segment_text(indexed: &str, start: i64, end: i64) -> Option<String> {
    let lines: Vec<&str> = indexed
        .lines()
        .filter(|line| line_index(line).is_some_and(|idx| idx >= start && idx <= end))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Parse `<content>`/`<caption>` style multimodal responses with the
/// documented fallbacks: raw text when the content tag is missing, first
/// sentence (capped at 200 chars) when the caption tag is missing.
fn parse_multimodal_response(raw: &str, content_tag: &str) -> (Option<String>, Option<String>) {
    let content =
        extract_tag_content(raw, content_tag).or_else(|| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
    let caption = extract_tag_content(raw, "caption").or_else(|| {
        content.as_deref().map(|c| {
            let first_sentence = c.split('.').next().unwrap_or(c);
            first_sentence.chars().take(200).collect()
        })
    });
    (content, caption)
}

/// Derived URL for one segment of a multi-segment resource.
fn segment_resource_url(base_url: &str, idx: usize, total_segments: usize) -> String {
    if total_segments <= 1 {
        return base_url.to_string();
    }
    let path = std::path::Path::new(base_url);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base_url);
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{stem}_#segment_{idx}{suffix}")
}

/// One `<memory>` entry from the extraction response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedMemory {
    pub content: String,
    pub categories: Vec<String>,
}

const EXTRACTION_ROOT_TAGS: [&str; 6] =
    ["item", "profile", "behaviors", "events", "knowledge", "skills"];

/// Locate the outermost known root element, tolerating surrounding prose.
fn find_xml_boundaries(raw: &str) -> Option<(usize, usize)> {
    for tag in EXTRACTION_ROOT_TAGS {
        let opening = format!("<{tag}>");
        let closing = format!("</{tag}>");
        if let Some(start) = raw.find(&opening) {
            if let Some(end) = raw.rfind(&closing) {
                if end > start {
                    return Some((start, end + closing.len()));
                }
            }
        }
    }
    None
}

/// Tolerantly parse the extraction XML for one memory type.
///
/// Accepts leading/trailing prose and bare ampersands; entries missing
/// either content or categories are skipped. Unparseable responses yield an
/// empty list (the caller drops that memory type for the segment).
pub(crate) fn parse_memory_extraction_xml(raw: &str) -> Vec<ParsedMemory> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let Some((start, end)) = find_xml_boundaries(raw) else {
        warn!("could not find a known root tag in extraction response");
        return Vec::new();
    };
    let xml = raw[start..end].replace('&', "&amp;");

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut memories = Vec::new();
    let mut current: Option<ParsedMemory> = None;
    let mut text_target: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.name().as_ref() {
                b"memory" => {
                    current = Some(ParsedMemory {
                        content: String::new(),
                        categories: Vec::new(),
                    });
                }
                b"content" => text_target = Some("content"),
                b"category" => text_target = Some("category"),
                _ => {}
            },
            Ok(Event::Text(text)) => {
                let Some(memory) = current.as_mut() else {
                    continue;
                };
                let Ok(decoded) = text.unescape() else {
                    continue;
                };
                match text_target {
                    Some("content") => memory.content.push_str(&decoded),
                    Some("category") => memory.categories.push(decoded.trim().to_string()),
                    _ => {}
                }
            }
            Ok(Event::End(element)) => match element.name().as_ref() {
                b"memory" => {
                    if let Some(memory) = current.take() {
                        if !memory.content.trim().is_empty() && !memory.categories.is_empty() {
                            memories.push(memory);
                        }
                    }
                }
                b"content" | b"category" => text_target = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to parse extraction XML");
                return Vec::new();
            }
        }
    }
    memories
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_url_keeps_single_segment_unchanged() {
        assert_eq!(segment_resource_url("chat.json", 0, 1), "chat.json");
    }

    #[test]
    fn segment_url_inserts_segment_marker() {
        assert_eq!(segment_resource_url("chat.json", 2, 3), "chat_#segment_2.json");
        assert_eq!(segment_resource_url("notes", 0, 2), "notes_#segment_0");
    }

    #[test]
    fn extraction_xml_parses_well_formed_response() {
        let raw = "<profile>\n<memory><content>The user loves coffee</content>\
                   <categories><category>preferences</category><category>habits</category></categories>\
                   </memory></profile>";
        let memories = parse_memory_extraction_xml(raw);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "The user loves coffee");
        assert_eq!(memories[0].categories, vec!["preferences", "habits"]);
    }

    #[test]
    fn extraction_xml_tolerates_prose_and_ampersands() {
        let raw = "Here are the memories:\n<events><memory>\
                   <content>Visited R&D lab</content>\
                   <categories><category>experiences</category></categories>\
                   </memory></events>\nDone!";
        let memories = parse_memory_extraction_xml(raw);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "Visited R&D lab");
    }

    #[test]
    fn extraction_xml_skips_incomplete_memories() {
        let raw = "<knowledge>\
                   <memory><content>No categories here</content></memory>\
                   <memory><content>Complete</content><categories><category>knowledge</category></categories></memory>\
                   </knowledge>";
        let memories = parse_memory_extraction_xml(raw);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "Complete");
    }

    #[test]
    fn extraction_xml_without_root_tag_is_empty() {
        assert!(parse_memory_extraction_xml("just some prose").is_empty());
        assert!(parse_memory_extraction_xml("").is_empty());
    }

    #[test]
    fn multimodal_parsing_with_both_tags() {
        let raw = "<processed_content>Long text.</processed_content><caption>Short.</caption>";
        let (content, caption) = parse_multimodal_response(raw, "processed_content");
        assert_eq!(content.as_deref(), Some("Long text."));
        assert_eq!(caption.as_deref(), Some("Short."));
    }

    #[test]
    fn multimodal_parsing_falls_back_to_raw_and_first_sentence() {
        let raw = "A plain description without tags. More detail follows.";
        let (content, caption) = parse_multimodal_response(raw, "processed_content");
        assert_eq!(content.as_deref(), Some(raw));
        assert_eq!(
            caption.as_deref(),
            Some("A plain description without tags")
        );
    }

    #[test]
    fn segments_payload_parses_from_prose() {
        let raw = "<conversation>...</conversation>\n{\"segments\": [{\"start\": 0, \"end\": 4}, {\"start\": 5, \"end\": 9, \"caption\": \"t\"}]}";
        let segments = parse_segments_payload(raw).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[1].end, 9);
    }

    #[test]
    fn segment_text_filters_by_index_markers() {
        let indexed = "[0] a: hi\n[1] b: hello\n\n[2] a: bye";
        assert_eq!(
            extract_segment_text(indexed, 0, 1).as_deref(),
            Some("[0] a: hi\n[1] b: hello")
        );
        assert_eq!(extract_segment_text(indexed, 2, 5).as_deref(), Some("[2] a: bye"));
        assert!(extract_segment_text(indexed, 7, 9).is_none());
        assert_eq!(max_line_index(indexed), 2);
    }
}
