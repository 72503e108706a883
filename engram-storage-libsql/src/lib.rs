//! # libSQL Storage Backend
//!
//! Relational metadata store for the engram memory engine: one table per
//! record type with scope fields as columns, a JSON `extra` column indexed
//! on `content_hash` and `ref_id`, and optional in-database cosine ranking
//! through libSQL's vector functions.
//!
//! Salience ranking is always computed in process (it is not a distance
//! function), so it loads the scoped pool and scores it with
//! `engram_core::vector`.

pub mod categories;
pub mod items;
pub mod relations;
pub mod resources;
pub mod schema;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use engram_core::storage::Database;
use engram_core::types::Scope;
use engram_core::{Error, Result};
use libsql::Value;
use tracing::info;
use uuid::Uuid;

use categories::LibsqlCategoryRepo;
use items::LibsqlItemRepo;
use relations::LibsqlRelationRepo;
use resources::LibsqlResourceRepo;

/// Connection settings for one libSQL database.
#[derive(Debug, Clone)]
pub struct LibsqlConfig {
    /// Local path or `file:` URL
    pub dsn: String,
    /// Scope fields, one column each, in declaration order
    pub scope_fields: Vec<String>,
    /// Serve similarity queries with in-database vector functions
    pub native_vectors: bool,
}

/// Shared connection state for the four repositories.
pub(crate) struct Shared {
    // Keeps the database handle alive for the connection's lifetime.
    _db: libsql::Database,
    pub(crate) conn: libsql::Connection,
    pub(crate) scope_fields: Vec<String>,
    pub(crate) native_vectors: bool,
    /// Serializes find-or-bump for reinforcement creates.
    pub(crate) reinforce_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    /// `AND field = ?` for each filter entry, validating field names.
    pub(crate) fn scope_filter_sql(
        &self,
        filter: &Scope,
        params: &mut Vec<Value>,
    ) -> Result<String> {
        let mut sql = String::new();
        for (field, value) in filter.iter() {
            if !self.scope_fields.iter().any(|f| f == field) {
                return Err(Error::InvalidInput(format!(
                    "unknown filter field '{field}' for current user scope"
                )));
            }
            sql.push_str(&format!(" AND {field} = ?"));
            params.push(Value::Text(value.to_string()));
        }
        Ok(sql)
    }

    /// Exact-scope match: every configured field equals the given scope's
    /// value, with unset fields matching NULL.
    pub(crate) fn scope_exact_sql(&self, scope: &Scope, params: &mut Vec<Value>) -> String {
        let mut sql = String::new();
        for field in &self.scope_fields {
            match scope.get(field) {
                Some(value) => {
                    sql.push_str(&format!(" AND {field} = ?"));
                    params.push(Value::Text(value.to_string()));
                }
                None => sql.push_str(&format!(" AND {field} IS NULL")),
            }
        }
        sql
    }

    /// Values for the scope columns of an INSERT, in column order.
    pub(crate) fn scope_insert_values(&self, scope: &Scope) -> Vec<Value> {
        self.scope_fields
            .iter()
            .map(|field| match scope.get(field) {
                Some(value) => Value::Text(value.to_string()),
                None => Value::Null,
            })
            .collect()
    }

    /// Comma-separated scope column list for SELECT/INSERT statements.
    pub(crate) fn scope_column_list(&self) -> String {
        self.scope_fields
            .iter()
            .map(|f| format!(", {f}"))
            .collect()
    }

    /// Parse the scope columns starting at `offset`.
    pub(crate) fn scope_from_row(&self, row: &libsql::Row, offset: i32) -> Result<Scope> {
        let mut scope = Scope::new();
        for (i, field) in self.scope_fields.iter().enumerate() {
            let value: Option<String> = row
                .get(offset + i as i32)
                .map_err(|e| Error::Storage(format!("failed to read scope column: {e}")))?;
            if let Some(value) = value {
                scope = scope.with(field.clone(), value);
            }
        }
        Ok(scope)
    }
}

/// [`Database`] implementation over libSQL.
pub struct LibsqlDatabase {
    resources: LibsqlResourceRepo,
    items: LibsqlItemRepo,
    categories: LibsqlCategoryRepo,
    relations: LibsqlRelationRepo,
}

impl std::fmt::Debug for LibsqlDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibsqlDatabase").finish_non_exhaustive()
    }
}

impl LibsqlDatabase {
    /// Open (creating if needed) a local database and run the schema DDL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for hostile scope field names and
    /// [`Error::Storage`] for connection or DDL failures.
    pub async fn connect(config: LibsqlConfig) -> Result<Self> {
        for field in &config.scope_fields {
            schema::validate_scope_field(field)?;
        }

        let path = config.dsn.strip_prefix("file:").unwrap_or(&config.dsn);
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| Error::Storage(format!("failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| Error::Storage(format!("failed to connect: {e}")))?;

        for statement in schema::all_statements(&config.scope_fields) {
            conn.execute(&statement, ())
                .await
                .map_err(|e| Error::Storage(format!("schema DDL failed: {e}")))?;
        }
        info!(dsn = %config.dsn, native_vectors = config.native_vectors, "libsql store ready");

        let shared = Arc::new(Shared {
            _db: db,
            conn,
            scope_fields: config.scope_fields,
            native_vectors: config.native_vectors,
            reinforce_lock: tokio::sync::Mutex::new(()),
        });
        Ok(Self {
            resources: LibsqlResourceRepo::new(Arc::clone(&shared)),
            items: LibsqlItemRepo::new(Arc::clone(&shared)),
            categories: LibsqlCategoryRepo::new(Arc::clone(&shared)),
            relations: LibsqlRelationRepo::new(shared),
        })
    }
}

impl Database for LibsqlDatabase {
    fn resources(&self) -> &dyn engram_core::storage::ResourceRepo {
        &self.resources
    }

    fn items(&self) -> &dyn engram_core::storage::MemoryItemRepo {
        &self.items
    }

    fn categories(&self) -> &dyn engram_core::storage::MemoryCategoryRepo {
        &self.categories
    }

    fn relations(&self) -> &dyn engram_core::storage::CategoryItemRepo {
        &self.relations
    }
}

// ============================================================================
// Row parsing helpers shared by the repositories
// ============================================================================

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get(idx)
        .map_err(|e| Error::Storage(format!("failed to read column {idx}: {e}")))
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    row.get(idx)
        .map_err(|e| Error::Storage(format!("failed to read column {idx}: {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Storage(format!("bad uuid in row: {e}")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp in row: {e}")))
}

pub(crate) fn parse_embedding(raw: Option<String>) -> Option<Vec<f32>> {
    raw.and_then(|text| serde_json::from_str(&text).ok())
}

pub(crate) fn embedding_to_json(embedding: &[f32]) -> Result<String> {
    serde_json::to_string(embedding).map_err(Error::Serialization)
}
