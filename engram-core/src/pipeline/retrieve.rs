//! The retrieve pipeline: a three-tier hierarchical recall (category ->
//! item -> resource) alternating with LLM sufficiency checks and query
//! rewriting.
//!
//! Two variants share the skeleton and differ only in ranking: the RAG
//! variant ranks by cosine similarity against stored embeddings, the LLM
//! variant asks the model for ids in relevance order. Failure semantics are
//! deliberately soft: a failed sufficiency check means "continue
//! retrieving", a failed ranker yields an empty tier, and only caller
//! errors (empty query list, unknown scope field) reject.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetrieveConfig;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::prompts::{render_template, retrieve as retrieve_prompts};
use crate::references::extract_references;
use crate::storage::Database;
use crate::types::{MemoryCategory, MemoryItem, RankingStrategy, Resource, Scope};
use crate::vector::{cosine_topk, cosine_topk_salience, SalienceCandidate};
use crate::workflow::{Capability, StepClients, StepConfig, StepHandler, Workflow, WorkflowStep};

use super::{
    extract_json_blob, extract_tag_content, format_query_context, CategoryView, MemoryItemView,
    QueryMessage, ResourceView,
};

const NO_CONTENT_YET: &str = "No content retrieved yet.";

/// Output of one retrieve invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub needs_retrieval: bool,
    pub original_query: String,
    pub rewritten_query: String,
    /// Query suggested by the last sufficiency check for a follow-up step
    pub next_step_query: Option<String>,
    pub categories: Vec<CategoryView>,
    pub items: Vec<MemoryItemView>,
    pub resources: Vec<ResourceView>,
}

/// Typed workflow state for retrieve.
#[derive(Debug, Default)]
pub struct RetrieveState {
    original_query: String,
    context_queries: Vec<QueryMessage>,
    /// Single-message calls never rewrite the original query
    skip_rewrite: bool,
    filter: Scope,

    needs_retrieval: bool,
    rewritten_query: String,
    active_query: String,
    next_step_query: Option<String>,
    proceed_to_items: bool,
    proceed_to_resources: bool,
    query_vector: Option<Vec<f32>>,

    category_hits: Vec<(Uuid, f32)>,
    category_summaries: HashMap<Uuid, String>,
    category_pool: Vec<MemoryCategory>,
    item_hits: Vec<(Uuid, f32)>,
    item_pool: Vec<MemoryItem>,
    resource_hits: Vec<(Uuid, f32)>,
    resource_pool: Vec<Resource>,

    llm_category_hits: Vec<CategoryView>,
    llm_item_hits: Vec<MemoryItemView>,
    llm_resource_hits: Vec<ResourceView>,

    response: Option<RetrieveResponse>,
}

/// The retrieve pipeline over one storage substrate.
pub struct RetrievePipeline {
    db: Arc<dyn Database>,
    config: RetrieveConfig,
}

impl std::fmt::Debug for RetrievePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievePipeline")
            .field("method", &self.config.method)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum RetrieveStepKind {
    RouteIntention,
    RagRouteCategory,
    RagCategorySufficiency,
    RagRecallItems,
    RagItemSufficiency,
    RagRecallResources,
    RagBuildContext,
    LlmRouteCategory,
    LlmCategorySufficiency,
    LlmRecallItems,
    LlmItemSufficiency,
    LlmRecallResources,
    LlmBuildContext,
}

/// Dispatches one workflow step to its pipeline method.
struct RetrieveHandler {
    pipeline: Arc<RetrievePipeline>,
    kind: RetrieveStepKind,
}

#[async_trait::async_trait]
impl StepHandler<RetrieveState> for RetrieveHandler {
    async fn run(&self, state: &mut RetrieveState, clients: StepClients) -> Result<()> {
        let p = &self.pipeline;
        match self.kind {
            RetrieveStepKind::RouteIntention => p.route_intention(state, clients).await,
            RetrieveStepKind::RagRouteCategory => p.rag_route_category(state, clients).await,
            RetrieveStepKind::RagCategorySufficiency => {
                p.rag_category_sufficiency(state, clients).await
            }
            RetrieveStepKind::RagRecallItems => p.rag_recall_items(state, clients).await,
            RetrieveStepKind::RagItemSufficiency => p.rag_item_sufficiency(state, clients).await,
            RetrieveStepKind::RagRecallResources => p.rag_recall_resources(state, clients).await,
            RetrieveStepKind::RagBuildContext => p.rag_build_context(state, clients).await,
            RetrieveStepKind::LlmRouteCategory => p.llm_route_category(state, clients).await,
            RetrieveStepKind::LlmCategorySufficiency => {
                p.llm_category_sufficiency(state, clients).await
            }
            RetrieveStepKind::LlmRecallItems => p.llm_recall_items(state, clients).await,
            RetrieveStepKind::LlmItemSufficiency => p.llm_item_sufficiency(state, clients).await,
            RetrieveStepKind::LlmRecallResources => p.llm_recall_resources(state, clients).await,
            RetrieveStepKind::LlmBuildContext => p.llm_build_context(state, clients).await,
        }
    }
}

const INITIAL_KEYS: [&str; 5] = [
    "original_query",
    "context_queries",
    "skip_rewrite",
    "route_intention",
    "filter",
];

impl RetrievePipeline {
    pub fn new(db: Arc<dyn Database>, config: RetrieveConfig) -> Self {
        Self { db, config }
    }

    /// Build the initial workflow state for a query list.
    pub fn initial_state(
        &self,
        original_query: String,
        context_queries: Vec<QueryMessage>,
        skip_rewrite: bool,
        filter: Scope,
    ) -> RetrieveState {
        RetrieveState {
            original_query,
            context_queries,
            skip_rewrite,
            filter,
            ..RetrieveState::default()
        }
    }

    /// Take the response out of a finished state.
    pub fn take_response(state: &mut RetrieveState) -> Result<RetrieveResponse> {
        state.response.take().ok_or_else(|| {
            crate::error::Error::Workflow("retrieve workflow produced no response".to_string())
        })
    }

    fn sufficiency_config(&self) -> StepConfig {
        StepConfig {
            chat_llm_profile: Some(self.config.sufficiency_check_llm_profile.clone()),
            embed_llm_profile: Some("embedding".to_string()),
        }
    }

    fn ranking_config(&self) -> StepConfig {
        StepConfig {
            chat_llm_profile: Some(self.config.llm_ranking_llm_profile.clone()),
            embed_llm_profile: None,
        }
    }

    fn embedding_config(&self) -> StepConfig {
        StepConfig {
            chat_llm_profile: None,
            embed_llm_profile: Some("embedding".to_string()),
        }
    }

    fn step(
        self: &Arc<Self>,
        id: &'static str,
        role: &'static str,
        requires: &'static [&'static str],
        produces: &'static [&'static str],
        capabilities: &'static [Capability],
        config: StepConfig,
        kind: RetrieveStepKind,
    ) -> WorkflowStep<RetrieveState> {
        WorkflowStep {
            id,
            role,
            requires,
            produces,
            capabilities,
            config,
            handler: Box::new(RetrieveHandler {
                pipeline: Arc::clone(self),
                kind,
            }),
        }
    }

    /// The RAG-variant workflow: vector ranking at every tier.
    pub fn workflow_rag(self: &Arc<Self>) -> Result<Workflow<RetrieveState>> {
        let steps = vec![
            self.step(
                "route_intention",
                "route_intention",
                &["route_intention", "original_query", "context_queries", "skip_rewrite"],
                &["needs_retrieval", "rewritten_query", "active_query", "next_step_query"],
                &[Capability::Llm],
                self.sufficiency_config(),
                RetrieveStepKind::RouteIntention,
            ),
            self.step(
                "route_category",
                "route_category",
                &["needs_retrieval", "active_query", "filter"],
                &["category_hits", "category_summaries", "category_pool", "query_vector"],
                &[Capability::Vector, Capability::Db],
                self.embedding_config(),
                RetrieveStepKind::RagRouteCategory,
            ),
            self.step(
                "sufficiency_after_category",
                "sufficiency_check",
                &["needs_retrieval", "active_query", "context_queries", "category_hits"],
                &["next_step_query", "proceed_to_items", "query_vector"],
                &[Capability::Llm, Capability::Vector],
                self.sufficiency_config(),
                RetrieveStepKind::RagCategorySufficiency,
            ),
            self.step(
                "recall_items",
                "recall_items",
                &["needs_retrieval", "proceed_to_items", "active_query", "query_vector", "filter"],
                &["item_hits", "item_pool"],
                &[Capability::Vector, Capability::Db],
                self.embedding_config(),
                RetrieveStepKind::RagRecallItems,
            ),
            self.step(
                "sufficiency_after_items",
                "sufficiency_check",
                &["needs_retrieval", "active_query", "context_queries", "item_hits"],
                &["next_step_query", "proceed_to_resources", "query_vector"],
                &[Capability::Llm, Capability::Vector],
                self.sufficiency_config(),
                RetrieveStepKind::RagItemSufficiency,
            ),
            self.step(
                "recall_resources",
                "recall_resources",
                &["needs_retrieval", "proceed_to_resources", "active_query", "query_vector", "filter"],
                &["resource_hits", "resource_pool"],
                &[Capability::Vector, Capability::Db],
                self.embedding_config(),
                RetrieveStepKind::RagRecallResources,
            ),
            self.step(
                "build_context",
                "build_context",
                &["needs_retrieval", "original_query", "rewritten_query"],
                &["response"],
                &[],
                StepConfig::default(),
                RetrieveStepKind::RagBuildContext,
            ),
        ];
        Workflow::new("retrieve_rag", &INITIAL_KEYS, steps)
    }

    /// The LLM-variant workflow: model-ranked ids at every tier.
    pub fn workflow_llm(self: &Arc<Self>) -> Result<Workflow<RetrieveState>> {
        let steps = vec![
            self.step(
                "route_intention",
                "route_intention",
                &["route_intention", "original_query", "context_queries", "skip_rewrite"],
                &["needs_retrieval", "rewritten_query", "active_query", "next_step_query"],
                &[Capability::Llm],
                self.sufficiency_config(),
                RetrieveStepKind::RouteIntention,
            ),
            self.step(
                "route_category",
                "route_category",
                &["needs_retrieval", "active_query", "filter"],
                &["llm_category_hits", "category_pool"],
                &[Capability::Llm, Capability::Db],
                self.ranking_config(),
                RetrieveStepKind::LlmRouteCategory,
            ),
            self.step(
                "sufficiency_after_category",
                "sufficiency_check",
                &["needs_retrieval", "active_query", "context_queries", "llm_category_hits"],
                &["next_step_query", "proceed_to_items"],
                &[Capability::Llm],
                self.sufficiency_config(),
                RetrieveStepKind::LlmCategorySufficiency,
            ),
            self.step(
                "recall_items",
                "recall_items",
                &["needs_retrieval", "proceed_to_items", "active_query", "llm_category_hits", "filter"],
                &["llm_item_hits", "item_pool"],
                &[Capability::Llm, Capability::Db],
                self.ranking_config(),
                RetrieveStepKind::LlmRecallItems,
            ),
            self.step(
                "sufficiency_after_items",
                "sufficiency_check",
                &["needs_retrieval", "active_query", "context_queries", "llm_item_hits"],
                &["next_step_query", "proceed_to_resources"],
                &[Capability::Llm],
                self.sufficiency_config(),
                RetrieveStepKind::LlmItemSufficiency,
            ),
            self.step(
                "recall_resources",
                "recall_resources",
                &["needs_retrieval", "proceed_to_resources", "active_query", "llm_item_hits", "filter"],
                &["llm_resource_hits", "resource_pool"],
                &[Capability::Llm, Capability::Db],
                self.ranking_config(),
                RetrieveStepKind::LlmRecallResources,
            ),
            self.step(
                "build_context",
                "build_context",
                &["needs_retrieval", "original_query", "rewritten_query"],
                &["response"],
                &[],
                StepConfig::default(),
                RetrieveStepKind::LlmBuildContext,
            ),
        ];
        Workflow::new("retrieve_llm", &INITIAL_KEYS, steps)
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    /// Decide whether retrieval is needed at all and rewrite the query.
    async fn route_intention(&self, state: &mut RetrieveState, clients: StepClients) -> Result<()> {
        if !self.config.route_intention {
            state.needs_retrieval = true;
            state.rewritten_query = state.original_query.clone();
            state.active_query = state.original_query.clone();
            state.next_step_query = None;
            return Ok(());
        }

        let chat = clients.chat()?;
        let (needs_retrieval, mut rewritten) = self
            .decide_if_retrieval_needed(
                &state.original_query,
                &state.context_queries,
                None,
                &chat,
            )
            .await;
        if state.skip_rewrite {
            rewritten = state.original_query.clone();
        }

        state.needs_retrieval = needs_retrieval;
        state.rewritten_query = rewritten.clone();
        state.active_query = rewritten;
        state.next_step_query = None;
        Ok(())
    }

    /// One sufficiency check: does the content so far answer the query, and
    /// how should the query read for the next tier?
    ///
    /// Any failure (transport or parse) degrades to "continue retrieving"
    /// with the query unchanged.
    async fn decide_if_retrieval_needed(
        &self,
        query: &str,
        context_queries: &[QueryMessage],
        retrieved_content: Option<&str>,
        chat: &Arc<dyn LlmClient>,
    ) -> (bool, String) {
        let history = format_query_context(context_queries);
        let content = retrieved_content
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(NO_CONTENT_YET);

        let template = match &self.config.sufficiency_check_prompt {
            Some(config) => {
                let resolved = config.resolve(&[]);
                if resolved.trim().is_empty() {
                    retrieve_prompts::SUFFICIENCY_USER_PROMPT.to_string()
                } else {
                    resolved
                }
            }
            None => retrieve_prompts::SUFFICIENCY_USER_PROMPT.to_string(),
        };
        let prompt = render_template(
            &template,
            &[
                ("query", query),
                ("conversation_history", &history),
                ("retrieved_content", content),
            ],
        );

        let response = match chat
            .summarize(&prompt, Some(retrieve_prompts::SUFFICIENCY_SYSTEM_PROMPT))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "sufficiency check failed, defaulting to retrieve");
                return (true, query.to_string());
            }
        };

        let decision = extract_decision(&response);
        let rewritten =
            extract_tag_content(&response, "rewritten_query").unwrap_or_else(|| query.to_string());
        (decision, rewritten)
    }

    // ========================================================================
    // RAG variant
    // ========================================================================

    async fn rag_route_category(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !self.config.category.enabled || !state.needs_retrieval {
            return Ok(());
        }
        let embed = clients.embed()?;
        state.category_pool = self.db.categories().list_categories(&state.filter).await?;

        let query_vector = match embed_one(&embed, &state.active_query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "query embedding failed, category tier is empty");
                return Ok(());
            }
        };

        // Rank against each category's running summary, embedded on the fly.
        let entries: Vec<(Uuid, String)> = state
            .category_pool
            .iter()
            .filter_map(|c| {
                c.summary
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| (c.id, s.to_string()))
            })
            .collect();

        if !entries.is_empty() {
            let summary_texts: Vec<String> = entries.iter().map(|(_, s)| s.clone()).collect();
            match embed.embed(&summary_texts).await {
                Ok(summary_vectors) => {
                    state.category_hits = cosine_topk(
                        &query_vector,
                        entries
                            .iter()
                            .zip(summary_vectors)
                            .map(|((id, _), vector)| (*id, Some(vector))),
                        self.config.category.top_k,
                    );
                    state.category_summaries = entries.into_iter().collect();
                }
                Err(e) => {
                    warn!(error = %e, "summary embedding failed, category tier is empty");
                }
            }
        }
        state.query_vector = Some(query_vector);
        Ok(())
    }

    async fn rag_category_sufficiency(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval {
            state.proceed_to_items = false;
            return Ok(());
        }
        if !self.config.category.enabled || !self.config.sufficiency_check {
            state.proceed_to_items = true;
            return Ok(());
        }

        let content = format_category_content(
            &state.category_hits,
            &state.category_summaries,
            &state.category_pool,
        );
        let chat = clients.chat()?;
        let (needs_more, rewritten) = self
            .decide_if_retrieval_needed(
                &state.active_query,
                &state.context_queries,
                Some(&content),
                &chat,
            )
            .await;

        state.next_step_query = Some(rewritten.clone());
        state.active_query = rewritten;
        state.proceed_to_items = needs_more;
        if needs_more {
            self.refresh_query_vector(state, &clients).await;
        }
        Ok(())
    }

    async fn rag_recall_items(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !self.config.item.enabled || !state.needs_retrieval || !state.proceed_to_items {
            return Ok(());
        }
        let embed = clients.embed()?;
        let query_vector = match &state.query_vector {
            Some(vector) => vector.clone(),
            None => match embed_one(&embed, &state.active_query).await {
                Ok(vector) => {
                    state.query_vector = Some(vector.clone());
                    vector
                }
                Err(e) => {
                    warn!(error = %e, "query embedding failed, item tier is empty");
                    return Ok(());
                }
            },
        };

        let ref_ids = if self.config.item.use_category_references {
            self.referenced_item_ids(state)
        } else {
            Vec::new()
        };

        if ref_ids.is_empty() {
            state.item_pool = self.db.items().list_items(&state.filter).await?;
            state.item_hits = self
                .db
                .items()
                .vector_search_items(
                    &query_vector,
                    self.config.item.top_k,
                    &state.filter,
                    self.config.item.ranking,
                    self.config.item.recency_decay_days,
                )
                .await?;
        } else {
            // Citation following narrows the candidate pool before ranking.
            let pool = self
                .db
                .items()
                .list_items_by_ref_ids(&ref_ids, &state.filter)
                .await?;
            state.item_hits = match self.config.item.ranking {
                RankingStrategy::Similarity => cosine_topk(
                    &query_vector,
                    pool.iter().map(|i| (i.id, Some(i.embedding.clone()))),
                    self.config.item.top_k,
                ),
                RankingStrategy::Salience => cosine_topk_salience(
                    &query_vector,
                    pool.iter().map(|i| SalienceCandidate {
                        id: i.id,
                        embedding: Some(i.embedding.clone()),
                        reinforcement_count: i.reinforcement_count(),
                        last_reinforced_at: i.last_reinforced_at(),
                    }),
                    self.config.item.top_k,
                    self.config.item.recency_decay_days,
                ),
            };
            state.item_pool = pool;
        }
        Ok(())
    }

    async fn rag_item_sufficiency(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval {
            state.proceed_to_resources = false;
            return Ok(());
        }
        if !self.config.item.enabled || !self.config.sufficiency_check {
            state.proceed_to_resources = true;
            return Ok(());
        }

        let content = format_item_content(&state.item_hits, &state.item_pool);
        let chat = clients.chat()?;
        let (needs_more, rewritten) = self
            .decide_if_retrieval_needed(
                &state.active_query,
                &state.context_queries,
                Some(&content),
                &chat,
            )
            .await;

        state.next_step_query = Some(rewritten.clone());
        state.active_query = rewritten;
        state.proceed_to_resources = needs_more;
        if needs_more {
            self.refresh_query_vector(state, &clients).await;
        }
        Ok(())
    }

    async fn rag_recall_resources(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval
            || !self.config.resource.enabled
            || !state.proceed_to_resources
        {
            return Ok(());
        }
        state.resource_pool = self.db.resources().list_resources(&state.filter).await?;
        let corpus: Vec<(Uuid, Option<Vec<f32>>)> = state
            .resource_pool
            .iter()
            .filter_map(|r| r.caption_embedding.clone().map(|e| (r.id, Some(e))))
            .collect();
        if corpus.is_empty() {
            return Ok(());
        }

        let query_vector = match &state.query_vector {
            Some(vector) => vector.clone(),
            None => {
                let embed = clients.embed()?;
                match embed_one(&embed, &state.active_query).await {
                    Ok(vector) => {
                        state.query_vector = Some(vector.clone());
                        vector
                    }
                    Err(e) => {
                        warn!(error = %e, "query embedding failed, resource tier is empty");
                        return Ok(());
                    }
                }
            }
        };
        state.resource_hits = cosine_topk(&query_vector, corpus, self.config.resource.top_k);
        Ok(())
    }

    async fn rag_build_context(
        &self,
        state: &mut RetrieveState,
        _clients: StepClients,
    ) -> Result<()> {
        let mut response = self.base_response(state);
        if state.needs_retrieval {
            response.categories = state
                .category_hits
                .iter()
                .filter_map(|(id, score)| {
                    state
                        .category_pool
                        .iter()
                        .find(|c| c.id == *id)
                        .map(|c| CategoryView::from_record(c, Some(*score)))
                })
                .collect();
            response.items = state
                .item_hits
                .iter()
                .filter_map(|(id, score)| {
                    state
                        .item_pool
                        .iter()
                        .find(|i| i.id == *id)
                        .map(|i| MemoryItemView::from_record(i, Some(*score)))
                })
                .collect();
            response.resources = state
                .resource_hits
                .iter()
                .filter_map(|(id, score)| {
                    state
                        .resource_pool
                        .iter()
                        .find(|r| r.id == *id)
                        .map(|r| ResourceView::from_record(r, Some(*score)))
                })
                .collect();
        }
        state.response = Some(response);
        Ok(())
    }

    /// Re-embed the active query after a sufficiency rewrite; failures keep
    /// the previous vector.
    async fn refresh_query_vector(&self, state: &mut RetrieveState, clients: &StepClients) {
        let Ok(embed) = clients.embed() else {
            return;
        };
        match embed_one(&embed, &state.active_query).await {
            Ok(vector) => state.query_vector = Some(vector),
            Err(e) => warn!(error = %e, "re-embedding rewritten query failed"),
        }
    }

    /// All `[ref:...]` ids cited by the chosen category summaries.
    fn referenced_item_ids(&self, state: &RetrieveState) -> Vec<String> {
        let mut ids = Vec::new();
        for (category_id, _) in &state.category_hits {
            let summary = state
                .category_summaries
                .get(category_id)
                .cloned()
                .or_else(|| {
                    state
                        .category_pool
                        .iter()
                        .find(|c| c.id == *category_id)
                        .and_then(|c| c.summary.clone())
                });
            if let Some(summary) = summary {
                for reference in extract_references(&summary) {
                    if !ids.contains(&reference) {
                        ids.push(reference);
                    }
                }
            }
        }
        ids
    }

    fn base_response(&self, state: &RetrieveState) -> RetrieveResponse {
        let rewritten = if state.rewritten_query.is_empty() {
            state.original_query.clone()
        } else {
            state.rewritten_query.clone()
        };
        RetrieveResponse {
            needs_retrieval: state.needs_retrieval,
            original_query: state.original_query.clone(),
            rewritten_query: rewritten,
            next_step_query: state.next_step_query.clone(),
            categories: Vec::new(),
            items: Vec::new(),
            resources: Vec::new(),
        }
    }

    // ========================================================================
    // LLM variant
    // ========================================================================

    async fn llm_route_category(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !self.config.category.enabled || !state.needs_retrieval {
            return Ok(());
        }
        state.category_pool = self.db.categories().list_categories(&state.filter).await?;
        if state.category_pool.is_empty() {
            return Ok(());
        }

        let categories_data = format_categories_for_llm(&state.category_pool);
        let prompt = render_template(
            retrieve_prompts::CATEGORY_RANKER_PROMPT,
            &[
                ("query", state.active_query.as_str()),
                ("top_k", self.config.category.top_k.to_string().as_str()),
                ("categories_data", categories_data.as_str()),
            ],
        );

        let chat = clients.chat()?;
        let response = match chat.summarize(&prompt, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "LLM category ranking failed, tier is empty");
                return Ok(());
            }
        };
        let Some(ids) = parse_ranked_ids(&response, "categories") else {
            warn!("failed to parse LLM category ranking response");
            return Ok(());
        };
        state.llm_category_hits = ids
            .iter()
            .filter_map(|id| {
                state
                    .category_pool
                    .iter()
                    .find(|c| c.id == *id)
                    .map(|c| CategoryView::from_record(c, None))
            })
            .collect();
        debug!(hits = state.llm_category_hits.len(), "LLM ranked categories");
        Ok(())
    }

    async fn llm_category_sufficiency(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval {
            state.proceed_to_items = false;
            return Ok(());
        }
        if !self.config.category.enabled || !self.config.sufficiency_check {
            state.proceed_to_items = true;
            return Ok(());
        }

        let content = format_llm_category_content(&state.llm_category_hits);
        let chat = clients.chat()?;
        let (needs_more, rewritten) = self
            .decide_if_retrieval_needed(
                &state.active_query,
                &state.context_queries,
                Some(&content),
                &chat,
            )
            .await;
        state.next_step_query = Some(rewritten.clone());
        state.active_query = rewritten;
        state.proceed_to_items = needs_more;
        Ok(())
    }

    async fn llm_recall_items(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval || !state.proceed_to_items || !self.config.item.enabled {
            return Ok(());
        }
        let category_ids: Vec<Uuid> = state.llm_category_hits.iter().map(|c| c.id).collect();
        if category_ids.is_empty() {
            debug!("no category hits, item tier is empty");
            return Ok(());
        }

        let ref_ids = if self.config.item.use_category_references {
            let mut ids = Vec::new();
            for category in &state.llm_category_hits {
                if let Some(summary) = &category.summary {
                    for reference in extract_references(summary) {
                        if !ids.contains(&reference) {
                            ids.push(reference);
                        }
                    }
                }
            }
            ids
        } else {
            Vec::new()
        };

        state.item_pool = if ref_ids.is_empty() {
            self.db.items().list_items(&state.filter).await?
        } else {
            self.db
                .items()
                .list_items_by_ref_ids(&ref_ids, &state.filter)
                .await?
        };
        let relations = self.db.relations().list_relations(&state.filter).await?;

        let items_data = format_items_for_llm(&state.item_pool, &relations, &category_ids);
        if items_data.is_empty() {
            return Ok(());
        }
        let relevant_categories = state
            .llm_category_hits
            .iter()
            .map(|c| {
                let detail = c.summary.clone().unwrap_or_else(|| c.description.clone());
                format!("- {}: {detail}", c.name)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = render_template(
            retrieve_prompts::ITEM_RANKER_PROMPT,
            &[
                ("query", state.active_query.as_str()),
                ("top_k", self.config.item.top_k.to_string().as_str()),
                ("relevant_categories", relevant_categories.as_str()),
                ("items_data", items_data.as_str()),
            ],
        );

        let chat = clients.chat()?;
        let response = match chat.summarize(&prompt, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "LLM item ranking failed, tier is empty");
                return Ok(());
            }
        };
        let Some(ids) = parse_ranked_ids(&response, "items") else {
            warn!("failed to parse LLM item ranking response");
            return Ok(());
        };
        state.llm_item_hits = ids
            .iter()
            .filter_map(|id| {
                state
                    .item_pool
                    .iter()
                    .find(|i| i.id == *id)
                    .map(|i| MemoryItemView::from_record(i, None))
            })
            .collect();
        Ok(())
    }

    async fn llm_item_sufficiency(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval {
            state.proceed_to_resources = false;
            return Ok(());
        }
        if !self.config.item.enabled || !self.config.sufficiency_check {
            state.proceed_to_resources = true;
            return Ok(());
        }

        let content = format_llm_item_content(&state.llm_item_hits);
        let chat = clients.chat()?;
        let (needs_more, rewritten) = self
            .decide_if_retrieval_needed(
                &state.active_query,
                &state.context_queries,
                Some(&content),
                &chat,
            )
            .await;
        state.next_step_query = Some(rewritten.clone());
        state.active_query = rewritten;
        state.proceed_to_resources = needs_more;
        Ok(())
    }

    async fn llm_recall_resources(
        &self,
        state: &mut RetrieveState,
        clients: StepClients,
    ) -> Result<()> {
        if !state.needs_retrieval
            || !state.proceed_to_resources
            || !self.config.resource.enabled
        {
            return Ok(());
        }
        let item_ids: Vec<Uuid> = state.llm_item_hits.iter().map(|i| i.id).collect();
        if item_ids.is_empty() {
            return Ok(());
        }

        state.resource_pool = self.db.resources().list_resources(&state.filter).await?;
        let resources_data =
            format_resources_for_llm(&state.resource_pool, &state.item_pool, &item_ids);
        if resources_data.is_empty() {
            return Ok(());
        }

        let mut context_parts = Vec::new();
        if !state.llm_category_hits.is_empty() {
            context_parts.push("Relevant Categories:".to_string());
            context_parts.extend(
                state
                    .llm_category_hits
                    .iter()
                    .map(|c| format!("- {}", c.name)),
            );
        }
        if !state.llm_item_hits.is_empty() {
            context_parts.push("\nRelevant Memory Items:".to_string());
            context_parts.extend(state.llm_item_hits.iter().take(3).map(|i| {
                let prefix: String = i.summary.chars().take(100).collect();
                format!("- {prefix}...")
            }));
        }
        let context_info = context_parts.join("\n");

        let prompt = render_template(
            retrieve_prompts::RESOURCE_RANKER_PROMPT,
            &[
                ("query", state.active_query.as_str()),
                ("top_k", self.config.resource.top_k.to_string().as_str()),
                ("context_info", context_info.as_str()),
                ("resources_data", resources_data.as_str()),
            ],
        );

        let chat = clients.chat()?;
        let response = match chat.summarize(&prompt, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "LLM resource ranking failed, tier is empty");
                return Ok(());
            }
        };
        let Some(ids) = parse_ranked_ids(&response, "resources") else {
            warn!("failed to parse LLM resource ranking response");
            return Ok(());
        };
        state.llm_resource_hits = ids
            .iter()
            .filter_map(|id| {
                state
                    .resource_pool
                    .iter()
                    .find(|r| r.id == *id)
                    .map(|r| ResourceView::from_record(r, None))
            })
            .collect();
        Ok(())
    }

    async fn llm_build_context(
        &self,
        state: &mut RetrieveState,
        _clients: StepClients,
    ) -> Result<()> {
        let mut response = self.base_response(state);
        if state.needs_retrieval {
            response.categories = state.llm_category_hits.clone();
            response.items = state.llm_item_hits.clone();
            response.resources = state.llm_resource_hits.clone();
        }
        state.response = Some(response);
        Ok(())
    }
}

// ============================================================================
// Free helpers
// ============================================================================

async fn embed_one(embed: &Arc<dyn LlmClient>, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embed.embed(std::slice::from_ref(&text.to_string())).await?;
    vectors
        .pop()
        .ok_or_else(|| crate::error::Error::Llm("embedding API returned no vector".to_string()))
}

/// Parse `<decision>` from a sufficiency response; ambiguity defaults to
/// "retrieve".
fn extract_decision(raw: &str) -> bool {
    if raw.trim().is_empty() {
        return true;
    }
    if let Some(decision) = extract_tag_content(raw, "decision") {
        let upper = decision.to_uppercase();
        if upper.contains("NO_RETRIEVE") || upper.contains("NO RETRIEVE") {
            return false;
        }
        if upper.contains("RETRIEVE") {
            return true;
        }
    }
    let upper = raw.to_uppercase();
    !(upper.contains("NO_RETRIEVE") || upper.contains("NO RETRIEVE"))
}

/// Parse an LLM ranker response: `{"<key>": ["id", ...]}` in relevance
/// order. Unknown or malformed ids are skipped.
fn parse_ranked_ids(raw: &str, key: &str) -> Option<Vec<Uuid>> {
    let blob = extract_json_blob(raw)?;
    let value: Value = serde_json::from_str(&blob).ok()?;
    let ids = value.get(key)?.as_array()?;
    Some(
        ids.iter()
            .filter_map(Value::as_str)
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect(),
    )
}

fn format_category_content(
    hits: &[(Uuid, f32)],
    summaries: &HashMap<Uuid, String>,
    pool: &[MemoryCategory],
) -> String {
    let mut sections = Vec::new();
    for (id, score) in hits {
        let Some(category) = pool.iter().find(|c| c.id == *id) else {
            continue;
        };
        let summary = summaries
            .get(id)
            .cloned()
            .or_else(|| category.summary.clone())
            .unwrap_or_default();
        sections.push(format!(
            "Category: {}\nSummary: {summary}\nScore: {score:.3}",
            category.name
        ));
    }
    sections.join("\n\n")
}

fn format_item_content(hits: &[(Uuid, f32)], pool: &[MemoryItem]) -> String {
    let mut sections = Vec::new();
    for (id, score) in hits {
        let Some(item) = pool.iter().find(|i| i.id == *id) else {
            continue;
        };
        sections.push(format!(
            "Memory Item ({}): {}\nScore: {score:.3}",
            item.memory_type, item.summary
        ));
    }
    sections.join("\n\n")
}

fn format_llm_category_content(hits: &[CategoryView]) -> String {
    hits.iter()
        .map(|c| {
            let summary = c.summary.clone().unwrap_or_else(|| c.description.clone());
            format!("Category: {}\nSummary: {summary}", c.name)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_llm_item_content(hits: &[MemoryItemView]) -> String {
    hits.iter()
        .map(|i| format!("Memory Item ({}): {}", i.memory_type, i.summary))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_categories_for_llm(pool: &[MemoryCategory]) -> String {
    if pool.is_empty() {
        return String::new();
    }
    let mut lines = Vec::new();
    for category in pool {
        lines.push(format!("ID: {}", category.id));
        lines.push(format!("Name: {}", category.name));
        if !category.description.is_empty() {
            lines.push(format!("Description: {}", category.description));
        }
        if let Some(summary) = &category.summary {
            lines.push(format!("Summary: {summary}"));
        }
        lines.push("---".to_string());
    }
    lines.join("\n")
}

/// Format candidate items, restricted to the hit categories through the
/// relation table.
fn format_items_for_llm(
    pool: &[MemoryItem],
    relations: &[crate::types::CategoryItem],
    category_ids: &[Uuid],
) -> String {
    let mut selected: Vec<&MemoryItem> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    if category_ids.is_empty() {
        selected.extend(pool.iter());
    } else {
        for relation in relations {
            if !category_ids.contains(&relation.category_id) {
                continue;
            }
            if let Some(item) = pool.iter().find(|i| i.id == relation.item_id) {
                if seen.insert(item.id) {
                    selected.push(item);
                }
            }
        }
    }
    if selected.is_empty() {
        return String::new();
    }

    let mut lines = Vec::new();
    for item in selected {
        lines.push(format!("ID: {}", item.id));
        lines.push(format!("Type: {}", item.memory_type));
        lines.push(format!("Summary: {}", item.summary));
        lines.push("---".to_string());
    }
    lines.join("\n")
}

/// Format candidate resources, restricted to the owners of the hit items.
fn format_resources_for_llm(
    pool: &[Resource],
    items: &[MemoryItem],
    item_ids: &[Uuid],
) -> String {
    let owner_ids: std::collections::HashSet<Uuid> = item_ids
        .iter()
        .filter_map(|id| items.iter().find(|i| i.id == *id))
        .filter_map(|i| i.resource_id)
        .collect();
    let selected: Vec<&Resource> = if owner_ids.is_empty() {
        Vec::new()
    } else {
        pool.iter().filter(|r| owner_ids.contains(&r.id)).collect()
    };
    if selected.is_empty() {
        return String::new();
    }

    let mut lines = Vec::new();
    for resource in selected {
        lines.push(format!("ID: {}", resource.id));
        lines.push(format!("URL: {}", resource.url));
        lines.push(format!("Modality: {}", resource.modality));
        if let Some(caption) = &resource.caption {
            lines.push(format!("Caption: {caption}"));
        }
        lines.push("---".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parsing_handles_tagged_and_bare_forms() {
        assert!(!extract_decision("<decision>NO_RETRIEVE</decision>"));
        assert!(extract_decision("<decision>RETRIEVE</decision>"));
        assert!(!extract_decision("the answer is NO_RETRIEVE"));
        assert!(extract_decision("something unrelated"));
        assert!(extract_decision(""));
    }

    #[test]
    fn ranked_ids_parse_in_order_and_skip_garbage() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let raw = format!(
            "Result:\n```json\n{{\"items\": [\"{b}\", \"not-a-uuid\", \"{a}\"]}}\n```"
        );
        let ids = parse_ranked_ids(&raw, "items").unwrap();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn ranked_ids_missing_key_is_none() {
        assert!(parse_ranked_ids("{\"other\": []}", "items").is_none());
        assert!(parse_ranked_ids("no json at all", "items").is_none());
    }
}
