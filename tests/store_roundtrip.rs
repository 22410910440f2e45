//! Store-level invariants: round trips, embedding linkage, cascades, and
//! uniqueness constraints.

mod common;

use common::*;
use palimpsest::errors::ArchiveError;
use palimpsest::model::{Chunk, ContentItem, ContentKind, Link, LinkType, Role, new_id, now_seconds};

fn chunk(id: &str, thread: &str, message: &str, index: i64, content: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        thread_id: thread.to_string(),
        message_id: message.to_string(),
        chunk_index: index,
        content: content.to_string(),
        word_count: content.split_whitespace().count() as i64,
        token_count: (content.len() / 4) as i64,
        content_type: ContentKind::Prose,
        language: None,
        start_offset: 0,
        end_offset: content.len(),
        context_before: None,
        context_after: None,
        embedding_id: None,
    }
}

#[tokio::test]
async fn conversation_round_trip_preserves_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let mut conv = conversation("conv-rt", "Round trip");
    conv.metadata = serde_json::json!({"gizmoId": "g-1", "modelSlug": "gpt-4o"});
    store.insert_conversation(&conv).await.unwrap();

    let loaded = store.get_conversation("conv-rt").await.unwrap().unwrap();
    assert_eq!(loaded.title, conv.title);
    assert_eq!(loaded.source, conv.source);
    assert_eq!(loaded.folder, conv.folder);
    assert_eq!(loaded.created_at, conv.created_at);
    assert_eq!(loaded.metadata["gizmoId"], "g-1");
    assert!(!loaded.is_interesting);
}

#[tokio::test]
async fn reimport_does_not_clobber_indexer_owned_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    store
        .insert_conversation(&conversation("conv-keep", "First"))
        .await
        .unwrap();
    store
        .mark_conversation_interesting("conv-keep", true)
        .await
        .unwrap();
    store
        .update_conversation_summary("conv-keep", "a summary", None)
        .await
        .unwrap();

    // Re-import with a new title.
    store
        .insert_conversation(&conversation("conv-keep", "Second"))
        .await
        .unwrap();

    let loaded = store.get_conversation("conv-keep").await.unwrap().unwrap();
    assert_eq!(loaded.title, "Second");
    assert!(loaded.is_interesting);
    assert_eq!(loaded.summary.as_deref(), Some("a summary"));
}

#[tokio::test]
async fn embedding_rows_link_owners_and_enforce_dimensions() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();

    seed_conversation(
        &store,
        "conv-e",
        "Embeddings",
        &[("m-1", Role::User, "a reasonably long user message body here")],
    )
    .await;

    // Wrong dimension is rejected up front.
    let err = store
        .insert_message_embedding("m-1", &vec![0.1f32; DIMS + 1])
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Invalid(_)));

    // Unknown owner is NotFound, not an orphan row.
    let vector = vector_for(&backend, "anything").await;
    let err = store
        .insert_message_embedding("missing", &vector)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound(_)));

    let embedding_id = store.insert_message_embedding("m-1", &vector).await.unwrap();
    let message = store.get_message("m-1").await.unwrap().unwrap();
    assert_eq!(message.embedding_id.as_deref(), Some(embedding_id.as_str()));

    let stored = store.get_message_embedding("m-1").await.unwrap().unwrap();
    assert_eq!(stored.len(), DIMS);
    let norm: f32 = stored.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn deleting_a_conversation_cascades_to_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();

    seed_conversation(
        &store,
        "conv-del",
        "Cascade",
        &[("m-del", Role::User, "another reasonably long message body here")],
    )
    .await;
    let vector = vector_for(&backend, "cascade").await;
    store.insert_message_embedding("m-del", &vector).await.unwrap();
    store
        .insert_chunk(&chunk("ch-del", "conv-del", "m-del", 0, "some chunk content"))
        .await
        .unwrap();
    store.insert_chunk_embedding("ch-del", &vector).await.unwrap();

    let before = store.get_stats().await.unwrap();
    assert_eq!(before.embeddings, 2);

    assert!(store.delete_conversation("conv-del").await.unwrap());
    let after = store.get_stats().await.unwrap();
    assert_eq!(after.conversations, 0);
    assert_eq!(after.messages, 0);
    assert_eq!(after.chunks, 0);
    assert_eq!(after.embeddings, 0);
}

#[tokio::test]
async fn chunk_index_uniqueness_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    seed_conversation(
        &store,
        "conv-u",
        "Unique",
        &[("m-u", Role::User, "a message that is long enough to matter")],
    )
    .await;
    store
        .insert_chunk(&chunk("ch-1", "conv-u", "m-u", 0, "first"))
        .await
        .unwrap();
    let err = store
        .insert_chunk(&chunk("ch-2", "conv-u", "m-u", 0, "second"))
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::StoreConflict(_)));
}

#[tokio::test]
async fn content_item_uri_is_unique() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let item = ContentItem {
        id: "item-1".into(),
        item_type: "post".into(),
        source: "facebook".into(),
        text: Some("a post body".into()),
        title: None,
        created_at: now_seconds(),
        author_name: None,
        is_own_content: true,
        thread_id: None,
        parent_id: None,
        media_refs: Vec::new(),
        metadata: serde_json::json!({}),
        uri: Some("content://facebook/post/1".into()),
    };
    store.insert_content_item(&item).await.unwrap();

    let clashing = ContentItem {
        id: "item-2".into(),
        ..item.clone()
    };
    let err = store.insert_content_item(&clashing).await.unwrap_err();
    assert!(matches!(err, ArchiveError::StoreConflict(_)));

    let by_uri = store
        .get_content_item_by_uri("content://facebook/post/1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_uri.id, "item-1");
}

#[tokio::test]
async fn message_search_filters_by_role() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();

    seed_conversation(
        &store,
        "conv-s",
        "Search",
        &[
            ("m-user", Role::User, "the user asks about sourdough starters"),
            ("m-asst", Role::Assistant, "the assistant explains sourdough hydration"),
        ],
    )
    .await;
    let query = vector_for(&backend, "sourdough").await;
    store
        .insert_message_embeddings_batch(vec![
            ("m-user".to_string(), vector_for(&backend, "user text").await),
            ("m-asst".to_string(), vector_for(&backend, "assistant text").await),
        ])
        .await
        .unwrap();

    let all = store.search_messages(&query, 10, None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].conversation_title, "Search");

    let only_user = store
        .search_messages(&query, 10, Some(Role::User))
        .await
        .unwrap();
    assert_eq!(only_user.len(), 1);
    assert_eq!(only_user[0].message_role, Role::User);
}

#[tokio::test]
async fn find_similar_excludes_self_and_optionally_same_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();

    seed_conversation(
        &store,
        "conv-a",
        "Alpha",
        &[
            ("m-a1", Role::User, "first message body that is long enough"),
            ("m-a2", Role::Assistant, "second message body that is long enough"),
        ],
    )
    .await;
    seed_conversation(
        &store,
        "conv-b",
        "Beta",
        &[("m-b1", Role::User, "third message body that is long enough")],
    )
    .await;

    let shared = vector_for(&backend, "shared topic").await;
    let ids = store
        .insert_message_embeddings_batch(vec![
            ("m-a1".to_string(), shared.clone()),
            ("m-a2".to_string(), shared.clone()),
            ("m-b1".to_string(), shared.clone()),
        ])
        .await
        .unwrap();

    let neighbors = store.find_similar_to_message(&ids[0], 10, false).await.unwrap();
    assert_eq!(neighbors.len(), 2);

    let other_conversations = store
        .find_similar_to_message(&ids[0], 10, true)
        .await
        .unwrap();
    assert_eq!(other_conversations.len(), 1);
    assert_eq!(other_conversations[0].conversation_id, "conv-b");

    let err = store
        .find_similar_to_message("nope", 10, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound(_)));
}

#[tokio::test]
async fn link_strength_validation_and_directions() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let link = Link {
        id: new_id(),
        source_uri: "content://a/doc/1".into(),
        target_uri: "content://b/doc/2".into(),
        link_type: LinkType::Reference,
        link_strength: 1.5,
        source_span: None,
        target_span: None,
        label: None,
        created_by: "test".into(),
        metadata: serde_json::json!({}),
        created_at: now_seconds(),
    };
    let err = store.insert_link(&link).await.unwrap_err();
    assert!(matches!(err, ArchiveError::Invalid(_)));

    let ok = Link {
        link_strength: 0.7,
        ..link
    };
    store.insert_link(&ok).await.unwrap();
    let found = store
        .find_links(
            "content://a/doc/1",
            palimpsest::store::LinkDirection::Both,
            None,
            10,
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].direction,
        palimpsest::store::LinkDirection::Outgoing
    );
}
