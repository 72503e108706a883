//! Resource repository over libSQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use engram_core::storage::{NewResource, ResourceRepo};
use engram_core::types::{Modality, Resource, Scope};
use engram_core::{Error, Result};
use libsql::Value;
use tracing::debug;
use uuid::Uuid;

use crate::{
    embedding_to_json, get_opt_text, get_text, parse_embedding, parse_timestamp, parse_uuid,
    Shared,
};

const COLUMNS: &str = "id, url, modality, local_path, caption, caption_embedding, created_at, updated_at";
const SCOPE_OFFSET: i32 = 8;

pub(crate) struct LibsqlResourceRepo {
    shared: Arc<Shared>,
}

impl LibsqlResourceRepo {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn row_to_resource(&self, row: &libsql::Row) -> Result<Resource> {
        Ok(Resource {
            id: parse_uuid(&get_text(row, 0)?)?,
            url: get_text(row, 1)?,
            modality: Modality::from(get_text(row, 2)?),
            local_path: get_text(row, 3)?,
            caption: get_opt_text(row, 4)?,
            caption_embedding: parse_embedding(get_opt_text(row, 5)?),
            created_at: parse_timestamp(&get_text(row, 6)?)?,
            updated_at: parse_timestamp(&get_text(row, 7)?)?,
            scope: self.shared.scope_from_row(row, SCOPE_OFFSET)?,
        })
    }

    async fn select_matching(&self, filter: &Scope) -> Result<Vec<Resource>> {
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!(
            "SELECT {COLUMNS}{} FROM resources WHERE 1=1{filter_sql}",
            self.shared.scope_column_list()
        );
        let mut rows = self
            .shared
            .conn
            .query(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to query resources: {e}")))?;

        let mut resources = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch resource row: {e}")))?
        {
            resources.push(self.row_to_resource(&row)?);
        }
        Ok(resources)
    }
}

#[async_trait]
impl ResourceRepo for LibsqlResourceRepo {
    async fn create_resource(&self, new: NewResource) -> Result<Resource> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let caption_embedding = new
            .caption_embedding
            .as_deref()
            .map(embedding_to_json)
            .transpose()?;

        let placeholders: String = self.shared.scope_fields.iter().map(|_| ", ?").collect();
        let sql = format!(
            "INSERT INTO resources ({COLUMNS}{}) VALUES (?, ?, ?, ?, ?, ?, ?, ?{placeholders})",
            self.shared.scope_column_list()
        );

        let mut params: Vec<Value> = vec![
            Value::Text(id.to_string()),
            Value::Text(new.url.clone()),
            Value::Text(new.modality.as_str().to_string()),
            Value::Text(new.local_path.clone()),
            new.caption.clone().map_or(Value::Null, Value::Text),
            caption_embedding.map_or(Value::Null, Value::Text),
            Value::Text(now.to_rfc3339()),
            Value::Text(now.to_rfc3339()),
        ];
        params.extend(self.shared.scope_insert_values(&new.scope));

        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to store resource: {e}")))?;
        debug!(resource_id = %id, url = %new.url, "stored resource");

        Ok(Resource {
            id,
            url: new.url,
            modality: new.modality,
            local_path: new.local_path,
            caption: new.caption,
            caption_embedding: new.caption_embedding,
            created_at: now,
            updated_at: now,
            scope: new.scope,
        })
    }

    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        let sql = format!(
            "SELECT {COLUMNS}{} FROM resources WHERE id = ?",
            self.shared.scope_column_list()
        );
        let mut rows = self
            .shared
            .conn
            .query(&sql, libsql::params![id.to_string()])
            .await
            .map_err(|e| Error::Storage(format!("failed to query resource: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch resource row: {e}")))?
        {
            Some(row) => Ok(Some(self.row_to_resource(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_resources(&self, filter: &Scope) -> Result<Vec<Resource>> {
        self.select_matching(filter).await
    }

    async fn clear_resources(&self, filter: &Scope) -> Result<Vec<Resource>> {
        let matching = self.select_matching(filter).await?;
        let mut params: Vec<Value> = Vec::new();
        let filter_sql = self.shared.scope_filter_sql(filter, &mut params)?;
        let sql = format!("DELETE FROM resources WHERE 1=1{filter_sql}");
        self.shared
            .conn
            .execute(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to clear resources: {e}")))?;
        Ok(matching)
    }
}
