//! Category repository over libSQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use engram_core::storage::MemoryCategoryRepo;
use engram_core::types::{MemoryCategory, Scope};
use engram_core::{Error, Result};
use libsql::Value;
use uuid::Uuid;

use crate::{
    embedding_to_json, get_opt_text, get_text, parse_embedding, parse_timestamp, parse_uuid,
    Shared,
};

const COLUMNS: &str = "id, name, description, embedding, summary, created_at, updated_at";
const SCOPE_OFFSET: i32 = 7;

pub(crate) struct LibsqlCategoryRepo {
    shared: Arc<Shared>,
}

impl LibsqlCategoryRepo {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn row_to_category(&self, row: &libsql::Row) -> Result<MemoryCategory> {
        Ok(MemoryCategory {
            id: parse_uuid(&get_text(row, 0)?)?,
            name: get_text(row, 1)?,
            description: get_text(row, 2)?,
            embedding: parse_embedding(get_opt_text(row, 3)?).unwrap_or_default(),
            summary: get_opt_text(row, 4)?,
            created_at: parse_timestamp(&get_text(row, 5)?)?,
            updated_at: parse_timestamp(&get_text(row, 6)?)?,
            scope: self.shared.scope_from_row(row, SCOPE_OFFSET)?,
        })
    }

    async fn query_categories(&self, sql: &str, params: Vec<Value>) -> Result<Vec<MemoryCategory>> {
        let mut rows = self
            .shared
            .conn
            .query(sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to query categories: {e}")))?;
        let mut categories = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch category row: {e}")))?
        {
            categories.push(self.row_to_category(&row)?);
        }
        Ok(categories)
    }

    async fn select_matching(&self, filter: &Scope) -> Result<Vec<MemoryCategory>> {
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_categories WHERE 1=1{filter_sql}",
            self.shared.scope_column_list()
        );
        self.query_categories(&sql, params).await
    }
}

#[async_trait]
impl MemoryCategoryRepo for LibsqlCategoryRepo {
    async fn get_or_create_category(
        &self,
        name: &str,
        description: &str,
        embedding: Vec<f32>,
        scope: Scope,
    ) -> Result<MemoryCategory> {
        let mut params: Vec<Value> = vec![Value::Text(name.to_string())];
        let scope_sql = self.shared.scope_exact_sql(&scope, &mut params);
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_categories WHERE name = ?{scope_sql}",
            self.shared.scope_column_list()
        );
        if let Some(existing) = self.query_categories(&sql, params).await?.into_iter().next() {
            return Ok(existing);
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let placeholders: String = self.shared.scope_fields.iter().map(|_| ", ?").collect();
        let sql = format!(
            "INSERT INTO memory_categories ({COLUMNS}{}) VALUES (?, ?, ?, ?, ?, ?, ?{placeholders})",
            self.shared.scope_column_list()
        );
        let mut params: Vec<Value> = vec![
            Value::Text(id.to_string()),
            Value::Text(name.to_string()),
            Value::Text(description.to_string()),
            Value::Text(embedding_to_json(&embedding)?),
            Value::Null,
            Value::Text(now.to_rfc3339()),
            Value::Text(now.to_rfc3339()),
        ];
        params.extend(self.shared.scope_insert_values(&scope));
        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to store category: {e}")))?;

        Ok(MemoryCategory {
            id,
            name: name.to_string(),
            description: description.to_string(),
            embedding,
            summary: None,
            created_at: now,
            updated_at: now,
            scope,
        })
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<MemoryCategory>> {
        let sql = format!(
            "SELECT {COLUMNS}{} FROM memory_categories WHERE id = ?",
            self.shared.scope_column_list()
        );
        Ok(self
            .query_categories(&sql, vec![Value::Text(id.to_string())])
            .await?
            .into_iter()
            .next())
    }

    async fn list_categories(&self, filter: &Scope) -> Result<Vec<MemoryCategory>> {
        self.select_matching(filter).await
    }

    async fn clear_categories(&self, filter: &Scope) -> Result<Vec<MemoryCategory>> {
        let matching = self.select_matching(filter).await?;
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!("DELETE FROM memory_categories WHERE 1=1{filter_sql}");
        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to clear categories: {e}")))?;
        Ok(matching)
    }

    async fn update_category_summary(&self, id: Uuid, summary: &str) -> Result<MemoryCategory> {
        let now = Utc::now();
        let affected = self
            .shared
            .conn
            .execute(
                "UPDATE memory_categories SET summary = ?, updated_at = ? WHERE id = ?",
                libsql::params![summary, now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to update summary: {e}")))?;
        if affected == 0 {
            return Err(Error::NotFound(id));
        }
        self.get_category(id).await?.ok_or(Error::NotFound(id))
    }
}
