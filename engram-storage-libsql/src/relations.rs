//! Category-item relation repository over libSQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use engram_core::storage::CategoryItemRepo;
use engram_core::types::{CategoryItem, Scope};
use engram_core::{Error, Result};
use libsql::Value;
use uuid::Uuid;

use crate::{get_text, parse_timestamp, parse_uuid, Shared};

const COLUMNS: &str = "id, item_id, category_id, created_at, updated_at";
const SCOPE_OFFSET: i32 = 5;

pub(crate) struct LibsqlRelationRepo {
    shared: Arc<Shared>,
}

impl LibsqlRelationRepo {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn row_to_relation(&self, row: &libsql::Row) -> Result<CategoryItem> {
        Ok(CategoryItem {
            id: parse_uuid(&get_text(row, 0)?)?,
            item_id: parse_uuid(&get_text(row, 1)?)?,
            category_id: parse_uuid(&get_text(row, 2)?)?,
            created_at: parse_timestamp(&get_text(row, 3)?)?,
            updated_at: parse_timestamp(&get_text(row, 4)?)?,
            scope: self.shared.scope_from_row(row, SCOPE_OFFSET)?,
        })
    }

    async fn query_relations(&self, sql: &str, params: Vec<Value>) -> Result<Vec<CategoryItem>> {
        let mut rows = self
            .shared
            .conn
            .query(sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to query relations: {e}")))?;
        let mut relations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch relation row: {e}")))?
        {
            relations.push(self.row_to_relation(&row)?);
        }
        Ok(relations)
    }

    async fn select_matching(&self, filter: &Scope) -> Result<Vec<CategoryItem>> {
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!(
            "SELECT {COLUMNS}{} FROM category_items WHERE 1=1{filter_sql}",
            self.shared.scope_column_list()
        );
        self.query_relations(&sql, params).await
    }
}

#[async_trait]
impl CategoryItemRepo for LibsqlRelationRepo {
    async fn link_item_category(
        &self,
        item_id: Uuid,
        category_id: Uuid,
        scope: Scope,
    ) -> Result<CategoryItem> {
        let mut params: Vec<Value> = vec![
            Value::Text(item_id.to_string()),
            Value::Text(category_id.to_string()),
        ];
        let scope_sql = self.shared.scope_exact_sql(&scope, &mut params);
        let sql = format!(
            "SELECT {COLUMNS}{} FROM category_items WHERE item_id = ? AND category_id = ?{scope_sql}",
            self.shared.scope_column_list()
        );
        if let Some(existing) = self.query_relations(&sql, params).await?.into_iter().next() {
            return Ok(existing);
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let placeholders: String = self.shared.scope_fields.iter().map(|_| ", ?").collect();
        let sql = format!(
            "INSERT INTO category_items ({COLUMNS}{}) VALUES (?, ?, ?, ?, ?{placeholders})",
            self.shared.scope_column_list()
        );
        let mut params: Vec<Value> = vec![
            Value::Text(id.to_string()),
            Value::Text(item_id.to_string()),
            Value::Text(category_id.to_string()),
            Value::Text(now.to_rfc3339()),
            Value::Text(now.to_rfc3339()),
        ];
        params.extend(self.shared.scope_insert_values(&scope));
        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to store relation: {e}")))?;

        Ok(CategoryItem {
            id,
            item_id,
            category_id,
            created_at: now,
            updated_at: now,
            scope,
        })
    }

    async fn list_relations(&self, filter: &Scope) -> Result<Vec<CategoryItem>> {
        self.select_matching(filter).await
    }

    async fn clear_relations(&self, filter: &Scope) -> Result<Vec<CategoryItem>> {
        let matching = self.select_matching(filter).await?;
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!("DELETE FROM category_items WHERE 1=1{filter_sql}");
        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to clear relations: {e}")))?;
        Ok(matching)
    }
}
