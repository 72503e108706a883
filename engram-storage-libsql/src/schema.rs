//! Database schema for the libSQL metadata store.
//!
//! Scope fields become one column each, appended after the fixed columns of
//! every table. The `extra` JSON column is indexed on the two keys the
//! engine point-queries: `content_hash` (deduplication) and `ref_id`
//! (citation following).

use engram_core::{Error, Result};

/// Reject scope field names that are not plain identifiers; they are
/// interpolated into DDL.
pub fn validate_scope_field(field: &str) -> Result<()> {
    let mut chars = field.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "scope field '{field}' is not a valid column name"
        )))
    }
}

fn scope_column_ddl(scope_fields: &[String]) -> String {
    scope_fields
        .iter()
        .map(|f| format!(",\n    {f} TEXT"))
        .collect()
}

/// SQL to create the resources table.
pub fn create_resources_table(scope_fields: &[String]) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY NOT NULL,
    url TEXT NOT NULL,
    modality TEXT NOT NULL,
    local_path TEXT NOT NULL,
    caption TEXT,
    caption_embedding TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL{}
)
",
        scope_column_ddl(scope_fields)
    )
}

/// SQL to create the memory items table.
pub fn create_items_table(scope_fields: &[String]) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS memory_items (
    id TEXT PRIMARY KEY NOT NULL,
    resource_id TEXT,
    memory_type TEXT NOT NULL,
    summary TEXT NOT NULL,
    embedding TEXT,
    happened_at TEXT,
    extra TEXT NOT NULL DEFAULT '{{}}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL{}
)
",
        scope_column_ddl(scope_fields)
    )
}

/// SQL to create the categories table.
pub fn create_categories_table(scope_fields: &[String]) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS memory_categories (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    embedding TEXT,
    summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL{}
)
",
        scope_column_ddl(scope_fields)
    )
}

/// SQL to create the category-item relation table.
pub fn create_relations_table(scope_fields: &[String]) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS category_items (
    id TEXT PRIMARY KEY NOT NULL,
    item_id TEXT NOT NULL,
    category_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL{}
)
",
        scope_column_ddl(scope_fields)
    )
}

/// Functional index for content-hash dedup lookups.
pub const CREATE_ITEMS_CONTENT_HASH_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_items_content_hash
ON memory_items(json_extract(extra, '$.content_hash'))
";

/// Functional index for citation lookups.
pub const CREATE_ITEMS_REF_ID_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_items_ref_id
ON memory_items(json_extract(extra, '$.ref_id'))
";

/// Unique relation per `(item, category, scope)`.
pub fn create_relations_unique_index(scope_fields: &[String]) -> String {
    let scope_columns: String = scope_fields.iter().map(|f| format!(", {f}")).collect();
    format!(
        r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_category_items_unique
ON category_items(item_id, category_id{scope_columns})
"
    )
}

/// All DDL statements for one database, in execution order.
pub fn all_statements(scope_fields: &[String]) -> Vec<String> {
    vec![
        create_resources_table(scope_fields),
        create_items_table(scope_fields),
        create_categories_table(scope_fields),
        create_relations_table(scope_fields),
        CREATE_ITEMS_CONTENT_HASH_INDEX.to_string(),
        CREATE_ITEMS_REF_ID_INDEX.to_string(),
        create_relations_unique_index(scope_fields),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_fields_become_columns() {
        let ddl = create_items_table(&["user_id".to_string(), "agent_id".to_string()]);
        assert!(ddl.contains("user_id TEXT"));
        assert!(ddl.contains("agent_id TEXT"));
    }

    #[test]
    fn hostile_scope_fields_are_rejected() {
        assert!(validate_scope_field("user_id").is_ok());
        assert!(validate_scope_field("_private").is_ok());
        assert!(validate_scope_field("user-id").is_err());
        assert!(validate_scope_field("1user").is_err());
        assert!(validate_scope_field("id; DROP TABLE x").is_err());
        assert!(validate_scope_field("").is_err());
    }
}
