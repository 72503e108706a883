//! Integration tests for the libSQL backend against a temp-file database.

use engram_core::storage::{Database, NewMemoryItem, NewResource};
use engram_core::types::{MemoryType, Modality, RankingStrategy, Scope};
use engram_storage_libsql::{LibsqlConfig, LibsqlDatabase};
use serde_json::{json, Map};

async fn open_db(dir: &tempfile::TempDir) -> LibsqlDatabase {
    LibsqlDatabase::connect(LibsqlConfig {
        dsn: dir
            .path()
            .join("engram.db")
            .to_string_lossy()
            .into_owned(),
        scope_fields: vec!["user_id".to_string(), "agent_id".to_string()],
        native_vectors: false,
    })
    .await
    .unwrap()
}

fn new_item(summary: &str, embedding: Vec<f32>, scope: Scope) -> NewMemoryItem {
    NewMemoryItem {
        resource_id: None,
        memory_type: MemoryType::Profile,
        summary: summary.to_string(),
        embedding,
        happened_at: None,
        scope,
    }
}

#[tokio::test]
async fn resources_round_trip_with_scope_filtering() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let created = db
        .resources()
        .create_resource(NewResource {
            url: "file:///notes.txt".to_string(),
            modality: Modality::Document,
            local_path: "/tmp/notes.txt".to_string(),
            caption: Some("notes".to_string()),
            caption_embedding: Some(vec![0.1, 0.9]),
            scope: Scope::for_user("u1"),
        })
        .await
        .unwrap();
    db.resources()
        .create_resource(NewResource {
            url: "file:///other.txt".to_string(),
            modality: Modality::Text,
            local_path: "/tmp/other.txt".to_string(),
            caption: None,
            caption_embedding: None,
            scope: Scope::for_user("u2"),
        })
        .await
        .unwrap();

    let fetched = db.resources().get_resource(created.id).await.unwrap().unwrap();
    assert_eq!(fetched.url, "file:///notes.txt");
    assert_eq!(fetched.modality, Modality::Document);
    assert_eq!(fetched.caption.as_deref(), Some("notes"));
    assert_eq!(fetched.caption_embedding.as_deref(), Some(&[0.1, 0.9][..]));
    assert_eq!(fetched.scope.get("user_id"), Some("u1"));

    let mine = db
        .resources()
        .list_resources(&Scope::for_user("u1"))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    let all = db.resources().list_resources(&Scope::new()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn reinforce_create_deduplicates_on_content_hash() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;
    let scope = Scope::for_user("u1");

    let first = db
        .items()
        .create_item_reinforce(new_item("User loves coffee", vec![1.0, 0.0], scope.clone()))
        .await
        .unwrap();
    assert!(!first.reinforced);
    assert_eq!(first.item.reinforcement_count(), 1);
    assert!(first.item.content_hash().is_some());

    // Whitespace and case differences hash identically.
    let second = db
        .items()
        .create_item_reinforce(new_item("  user LOVES   coffee ", vec![1.0, 0.0], scope.clone()))
        .await
        .unwrap();
    assert!(second.reinforced);
    assert_eq!(second.item.id, first.item.id);
    assert_eq!(second.item.reinforcement_count(), 2);

    // A different scope inserts a fresh row.
    let other = db
        .items()
        .create_item_reinforce(new_item("User loves coffee", vec![1.0, 0.0], Scope::for_user("u2")))
        .await
        .unwrap();
    assert!(!other.reinforced);

    assert_eq!(db.items().list_items(&Scope::new()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn ref_id_lookup_uses_the_extra_column() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;
    let scope = Scope::for_user("u1");

    let item = db
        .items()
        .create_item(new_item("cited", vec![1.0, 0.0], scope.clone()))
        .await
        .unwrap();
    db.items()
        .create_item(new_item("uncited", vec![1.0, 0.0], scope.clone()))
        .await
        .unwrap();

    let mut entries = Map::new();
    entries.insert("ref_id".to_string(), json!("abc123"));
    let updated = db.items().update_item_extra(item.id, entries).await.unwrap();
    assert_eq!(updated.ref_id(), Some("abc123"));

    let hits = db
        .items()
        .list_items_by_ref_ids(&["abc123".to_string(), "zzzzzz".to_string()], &scope)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, item.id);

    // Merging extra keys preserves the reinforcement fields.
    assert!(hits[0].content_hash().is_none());
}

#[tokio::test]
async fn vector_search_ranks_by_similarity_and_salience() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;
    let scope = Scope::for_user("u1");

    db.items()
        .create_item_reinforce(new_item("exact match once", vec![1.0, 0.0], scope.clone()))
        .await
        .unwrap();
    for _ in 0..9 {
        db.items()
            .create_item_reinforce(new_item(
                "near match many times",
                vec![0.9, 0.435_89],
                scope.clone(),
            ))
            .await
            .unwrap();
    }

    let by_similarity = db
        .items()
        .vector_search_items(&[1.0, 0.0], 2, &scope, RankingStrategy::Similarity, 30.0)
        .await
        .unwrap();
    assert_eq!(by_similarity.len(), 2);
    let top = db.items().get_item(by_similarity[0].0).await.unwrap().unwrap();
    assert_eq!(top.summary, "exact match once");

    // Salience flips the order: 0.9 * ln(10) beats 1.0 * ln(2).
    let by_salience = db
        .items()
        .vector_search_items(&[1.0, 0.0], 2, &scope, RankingStrategy::Salience, 30.0)
        .await
        .unwrap();
    let top = db.items().get_item(by_salience[0].0).await.unwrap().unwrap();
    assert_eq!(top.summary, "near match many times");
}

#[tokio::test]
async fn categories_and_relations_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;
    let scope = Scope::for_user("u1");

    let category = db
        .categories()
        .get_or_create_category("preferences", "likes and dislikes", vec![0.2, 0.8], scope.clone())
        .await
        .unwrap();
    // Same name and scope: no duplicate.
    let again = db
        .categories()
        .get_or_create_category("preferences", "likes and dislikes", vec![0.2, 0.8], scope.clone())
        .await
        .unwrap();
    assert_eq!(category.id, again.id);

    let updated = db
        .categories()
        .update_category_summary(category.id, "# preferences\n- coffee")
        .await
        .unwrap();
    assert_eq!(updated.summary.as_deref(), Some("# preferences\n- coffee"));

    let item = db
        .items()
        .create_item(new_item("coffee", vec![1.0, 0.0], scope.clone()))
        .await
        .unwrap();
    let relation = db
        .relations()
        .link_item_category(item.id, category.id, scope.clone())
        .await
        .unwrap();
    let duplicate = db
        .relations()
        .link_item_category(item.id, category.id, scope.clone())
        .await
        .unwrap();
    assert_eq!(relation.id, duplicate.id);
    assert_eq!(db.relations().list_relations(&scope).await.unwrap().len(), 1);
}

#[tokio::test]
async fn clear_is_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    db.items()
        .create_item(new_item("a", vec![1.0], Scope::for_user("u1")))
        .await
        .unwrap();
    db.items()
        .create_item(new_item("b", vec![1.0], Scope::for_user("u2")))
        .await
        .unwrap();

    let cleared = db.items().clear_items(&Scope::for_user("u1")).await.unwrap();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].summary, "a");
    let rest = db.items().list_items(&Scope::new()).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].summary, "b");
}

#[tokio::test]
async fn unknown_filter_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;
    let result = db
        .items()
        .list_items(&Scope::new().with("tenant", "t1"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn hostile_scope_field_names_fail_at_connect() {
    let dir = tempfile::tempdir().unwrap();
    let result = LibsqlDatabase::connect(LibsqlConfig {
        dsn: dir.path().join("x.db").to_string_lossy().into_owned(),
        scope_fields: vec!["user_id; DROP TABLE memory_items".to_string()],
        native_vectors: false,
    })
    .await;
    assert!(result.is_err());
}
