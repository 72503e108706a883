//! The service facade: configuration, one-time category initialization,
//! and the `memorize` / `retrieve` entrypoints.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use crate::blob::LocalFs;
use crate::config::{CategoryConfig, DatabaseProvider, ServiceConfig};
use crate::error::{Error, Result};
use crate::llm::LlmRegistry;
use crate::pipeline::{
    extract_query_text, MemorizePipeline, MemorizeRequest, MemorizeResponse, QueryMessage,
    RetrievePipeline, RetrieveResponse,
};
use crate::storage::inmemory::InMemoryDatabase;
use crate::storage::Database;
use crate::types::{MemoryType, RetrieveMethod, Scope};
use crate::workflow::{Capability, StepClients, WorkflowStep};

/// The embedded category set, built exactly once per service.
///
/// The first pipeline call awaits the initialization; later calls observe
/// it as a completed fact.
#[derive(Debug, Default)]
pub struct CategoryCatalog {
    /// Category ids in configuration order
    pub category_ids: Vec<Uuid>,
    /// Case-folded category name -> id
    pub name_to_id: HashMap<String, Uuid>,
    /// Pre-formatted category listing for extraction prompts
    pub prompt_listing: String,
}

struct ServiceInner {
    config: ServiceConfig,
    db: Arc<dyn Database>,
    llm: Arc<LlmRegistry>,
    fs: LocalFs,
    memory_types: Vec<MemoryType>,
    catalog: OnceCell<Arc<CategoryCatalog>>,
}

/// The long-term memory engine.
///
/// Cheap to clone; all clones share the storage substrate, the LLM
/// registry, and the one-time category initialization.
#[derive(Clone)]
pub struct MemoryService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("memory_types", &self.inner.memory_types)
            .finish_non_exhaustive()
    }
}

impl MemoryService {
    /// Build a service over an explicit storage backend and LLM registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the configuration names
    /// unknown memory types.
    pub fn new(
        config: ServiceConfig,
        db: Arc<dyn Database>,
        llm: Arc<LlmRegistry>,
    ) -> Result<Self> {
        let memory_types = config.memorize.resolve_memory_types()?;
        let fs = LocalFs::new(&config.blob.resources_dir);
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                db,
                llm,
                fs,
                memory_types,
                catalog: OnceCell::new(),
            }),
        })
    }

    /// Build a service over the in-memory backend.
    pub fn with_inmemory(config: ServiceConfig, llm: Arc<LlmRegistry>) -> Result<Self> {
        Self::new(config, Arc::new(InMemoryDatabase::new()), llm)
    }

    /// Build a service from configuration alone: LLM clients from the
    /// configured profiles, storage from the configured backend.
    ///
    /// Only the in-memory backend can be constructed here; relational
    /// backends live in their own crates and are passed to
    /// [`MemoryService::new`].
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        if config.database.provider != DatabaseProvider::Inmemory {
            return Err(Error::InvalidConfig(
                "relational backends are constructed by their storage crate; \
                 build the database there and use MemoryService::new"
                    .to_string(),
            ));
        }
        let llm = Arc::new(LlmRegistry::from_profiles(config.llm_profiles.clone())?);
        Self::with_inmemory(config, llm)
    }

    /// The storage substrate this service writes to.
    pub fn database(&self) -> Arc<dyn Database> {
        Arc::clone(&self.inner.db)
    }

    /// Ingest a resource: preprocess, extract memory items, categorize,
    /// and regenerate the affected category summaries.
    ///
    /// # Errors
    ///
    /// Caller errors (unknown scope field, missing preprocessing input) and
    /// workflow aborts (ingest failure, total LLM failure) are returned;
    /// partial parse failures degrade inside the pipeline.
    pub async fn memorize(&self, request: MemorizeRequest) -> Result<MemorizeResponse> {
        if let Some(user) = &request.user {
            user.validate_fields(&self.inner.config.scope_fields)?;
        }
        let catalog = self.ensure_categories(request.user.as_ref()).await?;

        let pipeline = Arc::new(MemorizePipeline::new(
            Arc::clone(&self.inner.db),
            self.inner.fs.clone(),
            self.inner.config.memorize.clone(),
            catalog,
        ));
        let workflow = pipeline.workflow()?;
        let mut state = pipeline.initial_state(request, self.inner.memory_types.clone());
        workflow
            .run(&mut state, |step| self.resolve_step_clients(step))
            .await?;
        MemorizePipeline::take_response(&mut state)
    }

    /// Hierarchical retrieval over categories, items, and resources.
    ///
    /// The last query is the current user turn; earlier entries are
    /// context. An empty query list is a caller error.
    pub async fn retrieve(
        &self,
        queries: &[QueryMessage],
        filter: Option<Scope>,
    ) -> Result<RetrieveResponse> {
        let Some(current) = queries.last() else {
            return Err(Error::InvalidInput("empty_queries".to_string()));
        };
        let original_query = extract_query_text(current)?;
        let filter = filter.unwrap_or_default();
        filter.validate_fields(&self.inner.config.scope_fields)?;

        let context_queries = if queries.len() > 1 {
            queries[..queries.len() - 1].to_vec()
        } else {
            Vec::new()
        };
        let skip_rewrite = queries.len() == 1;

        let pipeline = Arc::new(RetrievePipeline::new(
            Arc::clone(&self.inner.db),
            self.inner.config.retrieve.clone(),
        ));
        let workflow = match self.inner.config.retrieve.method {
            RetrieveMethod::Rag => pipeline.workflow_rag()?,
            RetrieveMethod::Llm => pipeline.workflow_llm()?,
        };
        let mut state =
            pipeline.initial_state(original_query, context_queries, skip_rewrite, filter);
        workflow
            .run(&mut state, |step| self.resolve_step_clients(step))
            .await?;
        RetrievePipeline::take_response(&mut state)
    }

    /// Resolve clients for a step from its capability tags and profile
    /// overrides.
    fn resolve_step_clients<S: Send>(&self, step: &WorkflowStep<S>) -> Result<StepClients> {
        let mut clients = StepClients::default();
        if step.has_capability(Capability::Llm) {
            let profile = step.config.chat_llm_profile.as_deref().unwrap_or("default");
            clients.chat = Some(self.inner.llm.client(profile)?);
        }
        if step.has_capability(Capability::Vector) {
            let profile = step
                .config
                .embed_llm_profile
                .as_deref()
                .unwrap_or("embedding");
            clients.embed = Some(self.inner.llm.client(profile)?);
        }
        Ok(clients)
    }

    /// Embed and persist the configured categories exactly once.
    ///
    /// Categories carry the scope of the memorize call that triggered
    /// initialization; retrieval never initializes them.
    async fn ensure_categories(&self, user: Option<&Scope>) -> Result<Arc<CategoryCatalog>> {
        let catalog = self
            .inner
            .catalog
            .get_or_try_init(|| async { self.initialize_categories(user).await })
            .await?;
        Ok(Arc::clone(catalog))
    }

    async fn initialize_categories(&self, user: Option<&Scope>) -> Result<Arc<CategoryCatalog>> {
        let configs = &self.inner.config.memorize.memory_categories;
        if configs.is_empty() {
            return Ok(Arc::new(CategoryCatalog::default()));
        }

        let texts: Vec<String> = configs.iter().map(CategoryConfig::embedding_text).collect();
        let embed = self.inner.llm.client("embedding")?;
        let vectors = embed.embed(&texts).await?;
        if vectors.len() != configs.len() {
            return Err(Error::Llm(format!(
                "embedding API returned {} vectors for {} categories",
                vectors.len(),
                configs.len()
            )));
        }

        let mut category_ids = Vec::with_capacity(configs.len());
        let mut name_to_id = HashMap::with_capacity(configs.len());
        for (config, vector) in configs.iter().zip(vectors) {
            let name = config.name.trim();
            let name = if name.is_empty() { "Untitled" } else { name };
            let category = self
                .inner
                .db
                .categories()
                .get_or_create_category(
                    name,
                    config.description.trim(),
                    vector,
                    user.cloned().unwrap_or_default(),
                )
                .await?;
            category_ids.push(category.id);
            name_to_id.insert(name.to_lowercase(), category.id);
        }
        info!(count = category_ids.len(), "initialized memory categories");

        Ok(Arc::new(CategoryCatalog {
            category_ids,
            name_to_id,
            prompt_listing: format_categories_for_prompt(configs),
        }))
    }
}

/// Category listing injected into extraction prompts.
fn format_categories_for_prompt(categories: &[CategoryConfig]) -> String {
    if categories.is_empty() {
        return "No categories provided.".to_string();
    }
    categories
        .iter()
        .map(|c| {
            let name = c.name.trim();
            let name = if name.is_empty() { "Untitled" } else { name };
            let description = c.description.trim();
            if description.is_empty() {
                format!("- {name}")
            } else {
                format!("- {name}: {description}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_listing_formats_names_and_descriptions() {
        let categories = vec![
            CategoryConfig::new("habits", "Routines"),
            CategoryConfig::new("goals", ""),
        ];
        assert_eq!(
            format_categories_for_prompt(&categories),
            "- habits: Routines\n- goals"
        );
        assert_eq!(format_categories_for_prompt(&[]), "No categories provided.");
    }
}
