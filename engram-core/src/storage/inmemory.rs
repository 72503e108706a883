//! In-memory metadata store: keyed vectors behind `parking_lot` locks with
//! linear scans. The reference backend for tests and embedded use.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{
    compute_content_hash, extra_keys, CategoryItem, MemoryCategory, MemoryItem, RankingStrategy,
    Resource, Scope,
};
use crate::vector::{cosine_topk, cosine_topk_salience, SalienceCandidate};

use super::{
    CategoryItemRepo, Database, MemoryCategoryRepo, MemoryItemRepo, NewMemoryItem, NewResource,
    ReinforceOutcome, ResourceRepo,
};

/// In-memory [`Database`] implementation.
///
/// Rows live in insertion-order vectors, which keeps vector-search
/// tie-breaks deterministic. Each repository holds its own lock; the write
/// lock over the item table is what serializes reinforcement updates for a
/// `(scope, content_hash)` pair.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    resources: InMemoryResourceRepo,
    items: InMemoryItemRepo,
    categories: InMemoryCategoryRepo,
    relations: InMemoryRelationRepo,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for InMemoryDatabase {
    fn resources(&self) -> &dyn ResourceRepo {
        &self.resources
    }

    fn items(&self) -> &dyn MemoryItemRepo {
        &self.items
    }

    fn categories(&self) -> &dyn MemoryCategoryRepo {
        &self.categories
    }

    fn relations(&self) -> &dyn CategoryItemRepo {
        &self.relations
    }
}

#[derive(Debug, Default)]
struct InMemoryResourceRepo {
    rows: RwLock<Vec<Resource>>,
}

#[async_trait]
impl ResourceRepo for InMemoryResourceRepo {
    async fn create_resource(&self, new: NewResource) -> Result<Resource> {
        let now = Utc::now();
        let resource = Resource {
            id: Uuid::new_v4(),
            url: new.url,
            modality: new.modality,
            local_path: new.local_path,
            caption: new.caption,
            caption_embedding: new.caption_embedding,
            created_at: now,
            updated_at: now,
            scope: new.scope,
        };
        self.rows.write().push(resource.clone());
        Ok(resource)
    }

    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(self.rows.read().iter().find(|r| r.id == id).cloned())
    }

    async fn list_resources(&self, filter: &Scope) -> Result<Vec<Resource>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|r| r.scope.matches(filter))
            .cloned()
            .collect())
    }

    async fn clear_resources(&self, filter: &Scope) -> Result<Vec<Resource>> {
        let mut rows = self.rows.write();
        let (cleared, kept) = rows.drain(..).partition(|r| r.scope.matches(filter));
        *rows = kept;
        Ok(cleared)
    }
}

#[derive(Debug, Default)]
struct InMemoryItemRepo {
    rows: RwLock<Vec<MemoryItem>>,
}

impl InMemoryItemRepo {
    fn build_item(new: NewMemoryItem, extra: Map<String, Value>) -> MemoryItem {
        let now = Utc::now();
        MemoryItem {
            id: Uuid::new_v4(),
            resource_id: new.resource_id,
            memory_type: new.memory_type,
            summary: new.summary,
            embedding: new.embedding,
            happened_at: new.happened_at,
            extra,
            created_at: now,
            updated_at: now,
            scope: new.scope,
        }
    }
}

#[async_trait]
impl MemoryItemRepo for InMemoryItemRepo {
    async fn create_item(&self, new: NewMemoryItem) -> Result<MemoryItem> {
        let item = Self::build_item(new, Map::new());
        self.rows.write().push(item.clone());
        Ok(item)
    }

    async fn create_item_reinforce(&self, new: NewMemoryItem) -> Result<ReinforceOutcome> {
        let content_hash = compute_content_hash(&new.summary, new.memory_type);
        let now = Utc::now();

        // Single write lock spans find-or-bump, serializing reinforcement
        // for a (scope, content_hash) pair.
        let mut rows = self.rows.write();
        let scope_filter = new.scope.clone();
        if let Some(existing) = rows.iter_mut().find(|item| {
            item.content_hash() == Some(content_hash.as_str()) && item.scope.matches(&scope_filter)
        }) {
            let count = existing.reinforcement_count() + 1;
            existing
                .extra
                .insert(extra_keys::REINFORCEMENT_COUNT.to_string(), json!(count));
            existing.extra.insert(
                extra_keys::LAST_REINFORCED_AT.to_string(),
                json!(now.to_rfc3339()),
            );
            existing.updated_at = now;
            debug!(item_id = %existing.id, count, "reinforced existing memory item");
            return Ok(ReinforceOutcome {
                item: existing.clone(),
                reinforced: true,
            });
        }

        let mut extra = Map::new();
        extra.insert(extra_keys::CONTENT_HASH.to_string(), json!(content_hash));
        extra.insert(extra_keys::REINFORCEMENT_COUNT.to_string(), json!(1));
        extra.insert(
            extra_keys::LAST_REINFORCED_AT.to_string(),
            json!(now.to_rfc3339()),
        );
        let item = Self::build_item(new, extra);
        rows.push(item.clone());
        Ok(ReinforceOutcome {
            item,
            reinforced: false,
        })
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        Ok(self.rows.read().iter().find(|i| i.id == id).cloned())
    }

    async fn list_items(&self, filter: &Scope) -> Result<Vec<MemoryItem>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|i| i.scope.matches(filter))
            .cloned()
            .collect())
    }

    async fn list_items_by_ref_ids(
        &self,
        ref_ids: &[String],
        filter: &Scope,
    ) -> Result<Vec<MemoryItem>> {
        if ref_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|i| i.scope.matches(filter))
            .filter(|i| {
                i.ref_id()
                    .is_some_and(|r| ref_ids.iter().any(|wanted| wanted.as_str() == r))
            })
            .cloned()
            .collect())
    }

    async fn clear_items(&self, filter: &Scope) -> Result<Vec<MemoryItem>> {
        let mut rows = self.rows.write();
        let (cleared, kept) = rows.drain(..).partition(|i| i.scope.matches(filter));
        *rows = kept;
        Ok(cleared)
    }

    async fn update_item_extra(&self, id: Uuid, entries: Map<String, Value>) -> Result<MemoryItem> {
        let mut rows = self.rows.write();
        let item = rows
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(Error::NotFound(id))?;
        for (key, value) in entries {
            item.extra.insert(key, value);
        }
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn vector_search_items(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &Scope,
        ranking: RankingStrategy,
        recency_half_life_days: f64,
    ) -> Result<Vec<(Uuid, f32)>> {
        let rows = self.rows.read();
        let pool = rows.iter().filter(|i| i.scope.matches(filter));
        let hits = match ranking {
            RankingStrategy::Similarity => cosine_topk(
                query,
                pool.map(|i| (i.id, Some(i.embedding.clone()))),
                top_k,
            ),
            RankingStrategy::Salience => cosine_topk_salience(
                query,
                pool.map(|i| SalienceCandidate {
                    id: i.id,
                    embedding: Some(i.embedding.clone()),
                    reinforcement_count: i.reinforcement_count(),
                    last_reinforced_at: i.last_reinforced_at(),
                }),
                top_k,
                recency_half_life_days,
            ),
        };
        Ok(hits)
    }
}

#[derive(Debug, Default)]
struct InMemoryCategoryRepo {
    rows: RwLock<Vec<MemoryCategory>>,
}

#[async_trait]
impl MemoryCategoryRepo for InMemoryCategoryRepo {
    async fn get_or_create_category(
        &self,
        name: &str,
        description: &str,
        embedding: Vec<f32>,
        scope: Scope,
    ) -> Result<MemoryCategory> {
        let mut rows = self.rows.write();
        if let Some(existing) = rows.iter().find(|c| c.name == name && c.scope == scope) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let category = MemoryCategory {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            embedding,
            summary: None,
            created_at: now,
            updated_at: now,
            scope,
        };
        rows.push(category.clone());
        Ok(category)
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<MemoryCategory>> {
        Ok(self.rows.read().iter().find(|c| c.id == id).cloned())
    }

    async fn list_categories(&self, filter: &Scope) -> Result<Vec<MemoryCategory>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|c| c.scope.matches(filter))
            .cloned()
            .collect())
    }

    async fn clear_categories(&self, filter: &Scope) -> Result<Vec<MemoryCategory>> {
        let mut rows = self.rows.write();
        let (cleared, kept) = rows.drain(..).partition(|c| c.scope.matches(filter));
        *rows = kept;
        Ok(cleared)
    }

    async fn update_category_summary(&self, id: Uuid, summary: &str) -> Result<MemoryCategory> {
        let mut rows = self.rows.write();
        let category = rows
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(Error::NotFound(id))?;
        category.summary = Some(summary.to_string());
        category.updated_at = Utc::now();
        Ok(category.clone())
    }
}

#[derive(Debug, Default)]
struct InMemoryRelationRepo {
    rows: RwLock<Vec<CategoryItem>>,
}

#[async_trait]
impl CategoryItemRepo for InMemoryRelationRepo {
    async fn link_item_category(
        &self,
        item_id: Uuid,
        category_id: Uuid,
        scope: Scope,
    ) -> Result<CategoryItem> {
        let mut rows = self.rows.write();
        if let Some(existing) = rows
            .iter()
            .find(|r| r.item_id == item_id && r.category_id == category_id && r.scope == scope)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let relation = CategoryItem {
            id: Uuid::new_v4(),
            item_id,
            category_id,
            created_at: now,
            updated_at: now,
            scope,
        };
        rows.push(relation.clone());
        Ok(relation)
    }

    async fn list_relations(&self, filter: &Scope) -> Result<Vec<CategoryItem>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|r| r.scope.matches(filter))
            .cloned()
            .collect())
    }

    async fn clear_relations(&self, filter: &Scope) -> Result<Vec<CategoryItem>> {
        let mut rows = self.rows.write();
        let (cleared, kept) = rows.drain(..).partition(|r| r.scope.matches(filter));
        *rows = kept;
        Ok(cleared)
    }
}
