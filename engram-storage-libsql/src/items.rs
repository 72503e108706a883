//! Memory item repository over libSQL: dedup + reinforcement, `ref_id`
//! lookups, and vector search.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use engram_core::storage::{MemoryItemRepo, NewMemoryItem, ReinforceOutcome};
use engram_core::types::{
    compute_content_hash, extra_keys, MemoryItem, MemoryType, RankingStrategy, Scope,
};
use engram_core::vector::{cosine_topk, cosine_topk_salience, SalienceCandidate};
use engram_core::{Error, Result};
use libsql::Value;
use serde_json::{json, Map};
use tracing::debug;
use uuid::Uuid;

use crate::{
    embedding_to_json, get_opt_text, get_text, parse_embedding, parse_timestamp, parse_uuid,
    Shared,
};

const COLUMNS: &str =
    "id, resource_id, memory_type, summary, embedding, happened_at, extra, created_at, updated_at";
const SCOPE_OFFSET: i32 = 9;

pub(crate) struct LibsqlItemRepo {
    shared: Arc<Shared>,
}

impl LibsqlItemRepo {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn row_to_item(&self, row: &libsql::Row) -> Result<MemoryItem> {
        let extra_json = get_text(row, 6)?;
        let extra: Map<String, serde_json::Value> =
            serde_json::from_str(&extra_json).map_err(Error::Serialization)?;
        Ok(MemoryItem {
            id: parse_uuid(&get_text(row, 0)?)?,
            resource_id: get_opt_text(row, 1)?
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            memory_type: MemoryType::parse(&get_text(row, 2)?)?,
            summary: get_text(row, 3)?,
            embedding: parse_embedding(get_opt_text(row, 4)?).unwrap_or_default(),
            happened_at: get_opt_text(row, 5)?
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            extra,
            created_at: parse_timestamp(&get_text(row, 7)?)?,
            updated_at: parse_timestamp(&get_text(row, 8)?)?,
            scope: self.shared.scope_from_row(row, SCOPE_OFFSET)?,
        })
    }

    async fn query_items(&self, sql: &str, params: Vec<Value>) -> Result<Vec<MemoryItem>> {
        let mut rows = self
            .shared
            .conn
            .query(sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to query items: {e}")))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch item row: {e}")))?
        {
            items.push(self.row_to_item(&row)?);
        }
        Ok(items)
    }

    async fn select_matching(&self, filter: &Scope) -> Result<Vec<MemoryItem>> {
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_items WHERE 1=1{filter_sql}",
            self.shared.scope_column_list()
        );
        self.query_items(&sql, params).await
    }

    async fn insert_item(&self, new: NewMemoryItem, extra: Map<String, serde_json::Value>) -> Result<MemoryItem> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let extra_json = serde_json::to_string(&extra).map_err(Error::Serialization)?;

        let placeholders: String = self.shared.scope_fields.iter().map(|_| ", ?").collect();
        let sql = format!(
            "INSERT INTO memory_items ({COLUMNS}{}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?{placeholders})",
            self.shared.scope_column_list()
        );
        let mut params: Vec<Value> = vec![
            Value::Text(id.to_string()),
            new.resource_id
                .map_or(Value::Null, |r| Value::Text(r.to_string())),
            Value::Text(new.memory_type.as_str().to_string()),
            Value::Text(new.summary.clone()),
            Value::Text(embedding_to_json(&new.embedding)?),
            new.happened_at
                .map_or(Value::Null, |t| Value::Text(t.to_rfc3339())),
            Value::Text(extra_json),
            Value::Text(now.to_rfc3339()),
            Value::Text(now.to_rfc3339()),
        ];
        params.extend(self.shared.scope_insert_values(&new.scope));

        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to store item: {e}")))?;

        Ok(MemoryItem {
            id,
            resource_id: new.resource_id,
            memory_type: new.memory_type,
            summary: new.summary,
            embedding: new.embedding,
            happened_at: new.happened_at,
            extra,
            created_at: now,
            updated_at: now,
            scope: new.scope,
        })
    }

    async fn find_by_hash(&self, content_hash: &str, scope: &Scope) -> Result<Option<MemoryItem>> {
        let mut params: Vec<Value> = vec![Value::Text(content_hash.to_string())];
        let scope_sql = self.shared.scope_exact_sql(scope, &mut params);
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_items \
             WHERE json_extract(extra, '$.content_hash') = ?{scope_sql}",
            self.shared.scope_column_list()
        );
        Ok(self.query_items(&sql, params).await?.into_iter().next())
    }

    async fn merge_extra(&self, id: Uuid, entries: Map<String, serde_json::Value>) -> Result<MemoryItem> {
        let Some(mut item) = self.get_item(id).await? else {
            return Err(Error::NotFound(id));
        };
        for (key, value) in entries {
            item.extra.insert(key, value);
        }
        let now = Utc::now();
        let extra_json = serde_json::to_string(&item.extra).map_err(Error::Serialization)?;
        self.shared
            .conn
            .execute(
                "UPDATE memory_items SET extra = ?, updated_at = ? WHERE id = ?",
                libsql::params![extra_json, now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to update item extra: {e}")))?;
        item.updated_at = now;
        Ok(item)
    }
}

#[async_trait]
impl MemoryItemRepo for LibsqlItemRepo {
    async fn create_item(&self, new: NewMemoryItem) -> Result<MemoryItem> {
        self.insert_item(new, Map::new()).await
    }

    async fn create_item_reinforce(&self, new: NewMemoryItem) -> Result<ReinforceOutcome> {
        let content_hash = compute_content_hash(&new.summary, new.memory_type);

        // The lock spans find-or-bump so concurrent memorize calls cannot
        // both insert the same (scope, content_hash).
        let _guard = self.shared.reinforce_lock.lock().await;

        if let Some(existing) = self.find_by_hash(&content_hash, &new.scope).await? {
            let count = existing.reinforcement_count() + 1;
            let mut entries = Map::new();
            entries.insert(extra_keys::REINFORCEMENT_COUNT.to_string(), json!(count));
            entries.insert(
                extra_keys::LAST_REINFORCED_AT.to_string(),
                json!(Utc::now().to_rfc3339()),
            );
            let item = self.merge_extra(existing.id, entries).await?;
            debug!(item_id = %item.id, count, "reinforced existing memory item");
            return Ok(ReinforceOutcome {
                item,
                reinforced: true,
            });
        }

        let mut extra = Map::new();
        extra.insert(extra_keys::CONTENT_HASH.to_string(), json!(content_hash));
        extra.insert(extra_keys::REINFORCEMENT_COUNT.to_string(), json!(1));
        extra.insert(
            extra_keys::LAST_REINFORCED_AT.to_string(),
            json!(Utc::now().to_rfc3339()),
        );
        let item = self.insert_item(new, extra).await?;
        Ok(ReinforceOutcome {
            item,
            reinforced: false,
        })
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_items WHERE id = ?",
            self.shared.scope_column_list()
        );
        Ok(self
            .query_items(&sql, vec![Value::Text(id.to_string())])
            .await?
            .into_iter()
            .next())
    }

    async fn list_items(&self, filter: &Scope) -> Result<Vec<MemoryItem>> {
        self.select_matching(filter).await
    }

    async fn list_items_by_ref_ids(
        &self,
        ref_ids: &[String],
        filter: &Scope,
    ) -> Result<Vec<MemoryItem>> {
        if ref_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut params: Vec<Value> = ref_ids
            .iter()
            .map(|r| Value::Text(r.clone()))
            .collect();
        let in_list: Vec<&str> = ref_ids.iter().map(|_| "?").collect();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_items \
             WHERE json_extract(extra, '$.ref_id') IN ({}){filter_sql}",
            self.shared.scope_column_list(),
            in_list.join(", ")
        );
        self.query_items(&sql, params).await
    }

    async fn clear_items(&self, filter: &Scope) -> Result<Vec<MemoryItem>> {
        let matching = self.select_matching(filter).await?;
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!("DELETE FROM memory_items WHERE 1=1{filter_sql}");
        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to clear items: {e}")))?;
        Ok(matching)
    }

    async fn update_item_extra(
        &self,
        id: Uuid,
        entries: Map<String, serde_json::Value>,
    ) -> Result<MemoryItem> {
        self.merge_extra(id, entries).await
    }

    async fn vector_search_items(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &Scope,
        ranking: RankingStrategy,
        recency_half_life_days: f64,
    ) -> Result<Vec<(Uuid, f32)>> {
        if ranking == RankingStrategy::Similarity && self.shared.native_vectors {
            // Serve plain similarity in the database with vector functions.
            let mut params: Vec<Value> = vec![Value::Text(embedding_to_json(query)?)];
            let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
            params.push(Value::Integer(top_k as i64));
            let sql = format!(
                "SELECT id, 1.0 - vector_distance_cos(vector32(embedding), vector32(?)) AS score \
                 FROM memory_items WHERE embedding IS NOT NULL{filter_sql} \
                 ORDER BY score DESC LIMIT ?"
            );
            let mut rows = self
                .shared
                .conn
                .query(&sql, libsql::params_from_iter(params))
                .await
                .map_err(|e| Error::Storage(format!("native vector search failed: {e}")))?;
            let mut hits = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| Error::Storage(format!("failed to fetch search row: {e}")))?
            {
                let id = parse_uuid(&get_text(&row, 0)?)?;
                let score: f64 = row
                    .get(1)
                    .map_err(|e| Error::Storage(format!("failed to read score: {e}")))?;
                hits.push((id, score as f32));
            }
            return Ok(hits);
        }

        // In-process scan; salience always takes this path.
        let pool = self.select_matching(filter).await?;
        let hits = match ranking {
            RankingStrategy::Similarity => cosine_topk(
                query,
                pool.iter().map(|i| (i.id, Some(i.embedding.clone()))),
                top_k,
            ),
            RankingStrategy::Salience => cosine_topk_salience(
                query,
                pool.iter().map(|i| SalienceCandidate {
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
