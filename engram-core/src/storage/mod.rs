//! # Storage Abstraction
//!
//! Repository traits for the four record types, plus the [`Database`]
//! aggregate that pipelines hold. Backends are interchangeable: the
//! in-memory backend in [`inmemory`] serves tests and embedded use, and the
//! `engram-storage-libsql` crate provides the relational backend.
//!
//! All operations are async. Reads are snapshot-consistent; writes to a
//! single entity are serialized by the backend. Pipelines never cache
//! repository results across await points beyond a single workflow step.

pub mod inmemory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{MemoryCategory, MemoryItem, MemoryType, Modality, RankingStrategy, Resource, Scope};
use crate::Result;

/// Fields for creating a resource.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub url: String,
    pub modality: Modality,
    pub local_path: String,
    pub caption: Option<String>,
    pub caption_embedding: Option<Vec<f32>>,
    pub scope: Scope,
}

/// Fields for creating a memory item.
#[derive(Debug, Clone)]
pub struct NewMemoryItem {
    pub resource_id: Option<Uuid>,
    pub memory_type: MemoryType,
    pub summary: String,
    pub embedding: Vec<f32>,
    pub happened_at: Option<DateTime<Utc>>,
    pub scope: Scope,
}

/// Result of a create-with-reinforce call.
#[derive(Debug, Clone)]
pub struct ReinforceOutcome {
    /// The new or reinforced item
    pub item: MemoryItem,
    /// True when an existing item was reinforced instead of inserted
    pub reinforced: bool,
}

/// Repository contract for resources.
#[async_trait]
pub trait ResourceRepo: Send + Sync {
    /// Insert a new resource.
    ///
    /// # Errors
    ///
    /// Returns error if the storage operation fails
    async fn create_resource(&self, new: NewResource) -> Result<Resource>;

    /// Retrieve a resource by id, or `None` if absent.
    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>>;

    /// List resources matching an equality scope filter.
    async fn list_resources(&self, filter: &Scope) -> Result<Vec<Resource>>;

    /// Delete and return resources matching the filter.
    async fn clear_resources(&self, filter: &Scope) -> Result<Vec<Resource>>;
}

/// Repository contract for memory items.
#[async_trait]
pub trait MemoryItemRepo: Send + Sync {
    /// Insert a new item unconditionally.
    ///
    /// # Errors
    ///
    /// Returns error if the storage operation fails
    async fn create_item(&self, new: NewMemoryItem) -> Result<MemoryItem>;

    /// Deduplicating insert.
    ///
    /// Computes the content hash; when an item with the same hash already
    /// exists within the creator's scope, bumps its reinforcement count,
    /// refreshes `last_reinforced_at`, and returns it otherwise unchanged.
    /// Only when no match exists is a new row inserted with
    /// `reinforcement_count = 1`.
    ///
    /// The find-or-bump for a given `(scope, content_hash)` pair is
    /// serialized by the backend, making it safe under concurrent
    /// memorize calls.
    async fn create_item_reinforce(&self, new: NewMemoryItem) -> Result<ReinforceOutcome>;

    /// Retrieve an item by id, or `None` if absent.
    async fn get_item(&self, id: Uuid) -> Result<Option<MemoryItem>>;

    /// List items matching an equality scope filter.
    async fn list_items(&self, filter: &Scope) -> Result<Vec<MemoryItem>>;

    /// Equality-set lookup on `extra.ref_id`.
    ///
    /// Used when retrieval follows `[ref:...]` citations from category
    /// summaries down to their source items.
    async fn list_items_by_ref_ids(&self, ref_ids: &[String], filter: &Scope)
        -> Result<Vec<MemoryItem>>;

    /// Delete and return items matching the filter.
    async fn clear_items(&self, filter: &Scope) -> Result<Vec<MemoryItem>>;

    /// Merge entries into an item's `extra` map.
    ///
    /// Existing keys not named in `entries` are preserved.
    async fn update_item_extra(&self, id: Uuid, entries: Map<String, Value>) -> Result<MemoryItem>;

    /// Vector search over item embeddings.
    ///
    /// `ranking` selects pure cosine similarity or salience weighting
    /// (similarity x ln(reinforcement+1) x recency half-life decay).
    /// Salience is always scored in process; it is not a distance function
    /// a native index could serve.
    async fn vector_search_items(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &Scope,
        ranking: RankingStrategy,
        recency_half_life_days: f64,
    ) -> Result<Vec<(Uuid, f32)>>;
}

/// Repository contract for memory categories.
#[async_trait]
pub trait MemoryCategoryRepo: Send + Sync {
    /// Fetch the category with this name in this scope, creating it (with
    /// the given description and embedding) when absent.
    async fn get_or_create_category(
        &self,
        name: &str,
        description: &str,
        embedding: Vec<f32>,
        scope: Scope,
    ) -> Result<MemoryCategory>;

    /// Retrieve a category by id, or `None` if absent.
    async fn get_category(&self, id: Uuid) -> Result<Option<MemoryCategory>>;

    /// List categories matching an equality scope filter.
    async fn list_categories(&self, filter: &Scope) -> Result<Vec<MemoryCategory>>;

    /// Delete and return categories matching the filter.
    async fn clear_categories(&self, filter: &Scope) -> Result<Vec<MemoryCategory>>;

    /// Rewrite a category's running summary (last writer wins).
    async fn update_category_summary(&self, id: Uuid, summary: &str) -> Result<MemoryCategory>;
}

/// Repository contract for category-item relations.
#[async_trait]
pub trait CategoryItemRepo: Send + Sync {
    /// Link an item to a category, carrying the item's scope.
    ///
    /// Idempotent: an existing `(item, category, scope)` link is returned
    /// instead of duplicated.
    async fn link_item_category(
        &self,
        item_id: Uuid,
        category_id: Uuid,
        scope: Scope,
    ) -> Result<crate::types::CategoryItem>;

    /// List relations matching an equality scope filter.
    async fn list_relations(&self, filter: &Scope) -> Result<Vec<crate::types::CategoryItem>>;

    /// Delete and return relations matching the filter.
    async fn clear_relations(&self, filter: &Scope) -> Result<Vec<crate::types::CategoryItem>>;
}

/// A full metadata store: one repository per record type.
pub trait Database: Send + Sync {
    fn resources(&self) -> &dyn ResourceRepo;
    fn items(&self) -> &dyn MemoryItemRepo;
    fn categories(&self) -> &dyn MemoryCategoryRepo;
    fn relations(&self) -> &dyn CategoryItemRepo;
}
