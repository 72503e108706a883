//! End-to-end memorize tests against the in-memory backend with a scripted
//! LLM client.

use std::sync::Arc;

use engram_core::pipeline::MemorizeRequest;
use engram_core::references::extract_references;
use engram_core::storage::Database;
use engram_core::types::{Modality, Scope};
use engram_core::ServiceConfig;
use test_utils::{
    empty_extraction_xml, extraction_xml, sample_conversation_json, service_with_mock,
    write_fixture, MockLlm,
};

const EXTRACTION_NEEDLE: &str = "# Task Objective";
const SUMMARY_NEEDLE: &str = "Existing summary:";
const SEGMENT_CAPTION_NEEDLE: &str = "Summarize the following conversation segment";

fn profile_only_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.memorize.memory_types = vec!["profile".to_string()];
    config
}

fn request(url: &str, modality: Modality) -> MemorizeRequest {
    MemorizeRequest {
        resource_url: url.to_string(),
        modality,
        user: Some(Scope::for_user("u1")),
    }
}

#[tokio::test]
async fn memorize_text_persists_resource_item_and_relation() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "note.txt", "I love coffee");

    let mock = Arc::new(
        MockLlm::new()
            .respond_when(
                EXTRACTION_NEEDLE,
                extraction_xml("profile", "The user loves coffee", "preferences"),
            )
            .respond_when(SUMMARY_NEEDLE, "# preferences\n- The user loves coffee"),
    );
    let service = service_with_mock(profile_only_config(), Arc::clone(&mock));

    let response = service
        .memorize(request(&url, Modality::Text))
        .await
        .unwrap();

    // Single segment: the resource comes back under the singular key.
    assert!(response.resource.is_some());
    assert!(response.resources.is_empty());
    assert_eq!(response.items.len(), 1);
    assert_eq!(response.items[0].summary, "The user loves coffee");
    assert_eq!(response.relations.len(), 1);

    // The affected category's summary was rewritten; others untouched.
    let scope = Scope::new();
    let categories = service
        .database()
        .categories()
        .list_categories(&scope)
        .await
        .unwrap();
    let preferences = categories.iter().find(|c| c.name == "preferences").unwrap();
    assert!(preferences.summary.as_deref().unwrap().contains("coffee"));
    let habits = categories.iter().find(|c| c.name == "habits").unwrap();
    assert!(habits.summary.is_none());
}

#[tokio::test]
async fn memorize_twice_reinforces_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "note.txt", "User loves coffee");

    let mut config = profile_only_config();
    config.memorize.enable_item_reinforcement = true;

    let mock = Arc::new(
        MockLlm::new()
            .respond_when(
                EXTRACTION_NEEDLE,
                extraction_xml("profile", "User loves coffee", "preferences"),
            )
            .respond_when(SUMMARY_NEEDLE, "- User loves coffee"),
    );
    let service = service_with_mock(config, Arc::clone(&mock));
    let scope = Scope::for_user("u1");

    let first = service
        .memorize(request(&url, Modality::Text))
        .await
        .unwrap();
    assert_eq!(first.relations.len(), 1);
    let first_item = service
        .database()
        .items()
        .list_items(&scope)
        .await
        .unwrap()
        .remove(0);
    let first_reinforced_at = first_item.last_reinforced_at().unwrap();

    let second = service
        .memorize(request(&url, Modality::Text))
        .await
        .unwrap();
    // Reinforcement: no new relation, the existing item is returned.
    assert!(second.relations.is_empty());

    let items = service.database().items().list_items(&scope).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, first_item.id);
    assert_eq!(items[0].reinforcement_count(), 2);
    assert!(items[0].last_reinforced_at().unwrap() >= first_reinforced_at);

    // Relations were not expanded by the reinforcement.
    let relations = service
        .database()
        .relations()
        .list_relations(&scope)
        .await
        .unwrap();
    assert_eq!(relations.len(), 1);
}

#[tokio::test]
async fn references_annotate_cited_items() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "note.txt", "Alice is 30 and lives in Lisbon");

    let mut config = profile_only_config();
    config.memorize.enable_item_references = true;

    let extraction = "<profile>\
        <memory><content>The user is 30 years old</content>\
        <categories><category>personal_info</category></categories></memory>\
        <memory><content>The user lives in Lisbon</content>\
        <categories><category>personal_info</category></categories></memory>\
        </profile>";

    // The summary responder echoes back every offered [shortid] as a
    // [ref:shortid] citation, the way the real prompt instructs the model.
    let mock = Arc::new(
        MockLlm::new()
            .respond_when(EXTRACTION_NEEDLE, extraction)
            .respond_when_fn(SUMMARY_NEEDLE, |prompt| {
                // Only the <items> input section carries this run's ids;
                // the prompt's examples must not leak into the summary.
                let items_section = prompt
                    .rsplit("<items>")
                    .next()
                    .and_then(|s| s.split("</items>").next())
                    .unwrap_or_default();
                let mut lines = vec!["# personal_info".to_string()];
                for line in items_section.lines() {
                    if let Some(rest) = line.strip_prefix("- [") {
                        if let Some((id, text)) = rest.split_once("] ") {
                            lines.push(format!("- {text} [ref:{id}]"));
                        }
                    }
                }
                lines.join("\n")
            }),
    );
    let service = service_with_mock(config, Arc::clone(&mock));

    let response = service
        .memorize(request(&url, Modality::Text))
        .await
        .unwrap();
    assert_eq!(response.items.len(), 2);

    let categories = service
        .database()
        .categories()
        .list_categories(&Scope::new())
        .await
        .unwrap();
    let personal = categories.iter().find(|c| c.name == "personal_info").unwrap();
    let summary = personal.summary.as_deref().unwrap();

    let refs = extract_references(summary);
    assert_eq!(refs.len(), 2);

    // Every citation resolves to an item carrying that ref_id.
    let scope = Scope::for_user("u1");
    for reference in &refs {
        let hits = service
            .database()
            .items()
            .list_items_by_ref_ids(std::slice::from_ref(reference), &scope)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1, "no item carries ref_id {reference}");
        assert_eq!(hits[0].ref_id(), Some(reference.as_str()));
    }
}

#[tokio::test]
async fn conversation_segmentation_creates_one_resource_per_segment() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "chat.json", &sample_conversation_json());

    let segments_response = "<conversation>rewritten, ignored</conversation>\n\
        {\"segments\": [{\"start\": 0, \"end\": 3}, {\"start\": 4, \"end\": 6}, {\"start\": 7, \"end\": 9}]}";

    let mock = Arc::new(
        MockLlm::new()
            .respond_when("Split it into topically coherent segments", segments_response)
            .respond_when(SEGMENT_CAPTION_NEEDLE, "Topic caption.")
            .respond_when(
                EXTRACTION_NEEDLE,
                extraction_xml("profile", "The user enjoys diving", "activities"),
            )
            .respond_when(SUMMARY_NEEDLE, "- The user enjoys diving"),
    );
    let service = service_with_mock(profile_only_config(), Arc::clone(&mock));

    let response = service
        .memorize(request(&url, Modality::Conversation))
        .await
        .unwrap();

    // Three segments: plural resources, each with its own caption.
    assert!(response.resource.is_none());
    assert_eq!(response.resources.len(), 3);
    for resource in &response.resources {
        assert_eq!(resource.caption.as_deref(), Some("Topic caption."));
        assert!(resource.url.contains("#segment_"));
    }

    // Extraction ran once per segment (one configured memory type).
    let extraction_calls = mock
        .chat_prompts()
        .into_iter()
        .filter(|p| p.contains(EXTRACTION_NEEDLE))
        .count();
    assert_eq!(extraction_calls, 3);
}

#[tokio::test]
async fn image_preprocessing_captions_the_resource() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "photo.jpg", "not really a jpeg");

    let mock = Arc::new(
        MockLlm::new()
            .with_vision_response(
                "<detailed_description>A tabby cat asleep on a couch.</detailed_description>\
                 <caption>A sleeping tabby cat.</caption>",
            )
            .respond_when(
                EXTRACTION_NEEDLE,
                extraction_xml("profile", "The user has a cat", "personal_info"),
            )
            .respond_when(SUMMARY_NEEDLE, "- The user has a cat"),
    );
    let service = service_with_mock(profile_only_config(), Arc::clone(&mock));

    let response = service
        .memorize(request(&url, Modality::Image))
        .await
        .unwrap();

    let view = response.resource.unwrap();
    assert_eq!(view.caption.as_deref(), Some("A sleeping tabby cat."));

    // Caption and its embedding are stored together on the record.
    let stored = service
        .database()
        .resources()
        .get_resource(view.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.caption_embedding.is_some());
}

#[tokio::test]
async fn unknown_category_names_leave_items_unlinked() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "note.txt", "some text");

    let mock = Arc::new(
        MockLlm::new()
            .respond_when(
                EXTRACTION_NEEDLE,
                extraction_xml("profile", "A fact", "not_a_configured_category"),
            )
            .respond_when(SUMMARY_NEEDLE, "- A fact"),
    );
    let service = service_with_mock(profile_only_config(), Arc::clone(&mock));

    let response = service
        .memorize(request(&url, Modality::Text))
        .await
        .unwrap();
    // Item persisted, relation dropped.
    assert_eq!(response.items.len(), 1);
    assert!(response.relations.is_empty());
}

#[tokio::test]
async fn empty_extraction_produces_no_items() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "note.txt", "nothing memorable");

    let mock = Arc::new(
        MockLlm::new().respond_when(EXTRACTION_NEEDLE, empty_extraction_xml("profile")),
    );
    let service = service_with_mock(profile_only_config(), Arc::clone(&mock));

    let response = service
        .memorize(request(&url, Modality::Text))
        .await
        .unwrap();
    assert!(response.items.is_empty());
    assert!(response.relations.is_empty());
    // The resource itself is still recorded.
    assert!(response.resource.is_some());
}

#[tokio::test]
async fn unknown_scope_field_is_a_caller_error() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_fixture(dir.path(), "note.txt", "text");

    let mock = Arc::new(MockLlm::new());
    let service = service_with_mock(profile_only_config(), mock);

    let result = service
        .memorize(MemorizeRequest {
            resource_url: url,
            modality: Modality::Text,
            user: Some(Scope::new().with("tenant_id", "t1")),
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn missing_resource_aborts_the_workflow() {
    let mock = Arc::new(MockLlm::new());
    let service = service_with_mock(profile_only_config(), mock);

    let result = service
        .memorize(request("/nonexistent/resource.txt", Modality::Text))
        .await;
    assert!(result.is_err());
}
