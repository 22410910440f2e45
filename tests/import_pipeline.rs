//! Import pipeline runs: detection, job lifecycle, persistence, and the
//! vectorization hand-off.

mod common;

use common::*;
use palimpsest::errors::ArchiveError;
use palimpsest::import::{ImportOptions, ImportPipeline};
use palimpsest::indexer::ArchiveIndexer;
use palimpsest::model::JobStatus;
use palimpsest::progress;
use std::sync::Arc;

fn claude_export() -> serde_json::Value {
    serde_json::json!([{
        "uuid": "c-import",
        "name": "Imported chat",
        "created_at": "2024-03-01T10:00:00Z",
        "updated_at": "2024-03-01T11:00:00Z",
        "chat_messages": [
            {"uuid": "cm-1", "sender": "human",
             "text": "Could you help me figure out why the archive import keeps stalling halfway?",
             "created_at": "2024-03-01T10:00:01Z"},
            {"uuid": "cm-2", "sender": "assistant",
             "text": "The stall usually means the media manifest is missing, so the importer waits on files that never arrive.",
             "created_at": "2024-03-01T10:00:05Z"}
        ]
    }])
}

#[tokio::test]
async fn claude_import_persists_and_vectorizes() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("conversations.json");
    tokio::fs::write(&export, claude_export().to_string())
        .await
        .unwrap();

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = Arc::new(ArchiveIndexer::new(
        store.clone(),
        backend.clone(),
        &test_config(),
    ));
    let pipeline = ImportPipeline::new(store.clone())
        .with_default_parsers()
        .with_indexer(indexer)
        .with_backend(backend.clone());

    let (sink, rx) = progress::channel(64);
    let job = pipeline
        .run_import(&export, ImportOptions::default(), sink)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.source_type, "claude_export");
    assert_eq!(job.counters.units_total, 1);
    assert_eq!(job.counters.units_processed, 1);
    assert_eq!(job.counters.errors_count, 0);
    assert!((job.progress - 1.0).abs() < f64::EPSILON);
    assert!(job.started_at_ms.is_some());
    assert!(job.completed_at_ms.is_some());

    // Persisted rows made it into the graph.
    let conversation = store.get_conversation("c-import").await.unwrap().unwrap();
    assert_eq!(conversation.source, "claude");
    let messages = store
        .get_messages_for_conversation("c-import")
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.embedding_id.is_some()));

    // The stored job row matches the returned snapshot.
    let stored = store.get_import_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);

    // Progress snapshots walked through the phases.
    let phases: Vec<String> = rx.drain().into_iter().map(|j| j.current_phase).collect();
    assert!(phases.contains(&"parsing".to_string()));
    assert!(phases.contains(&"persisting".to_string()));
    assert!(phases.contains(&"vectorizing".to_string()));
    assert_eq!(phases.last().map(String::as_str), Some("complete"));
}

#[tokio::test]
async fn facebook_import_embeds_content_items() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("posts.json");
    let posts = serde_json::json!([
        {
            "timestamp": 1_600_000_000,
            "title": "Lake day",
            "data": [{"post": "We finally made it out to the lake this weekend and the water was perfect for a long swim."}]
        },
        {
            "timestamp": 1_600_100_000,
            "data": [{"post": "ok"}]
        }
    ]);
    tokio::fs::write(&export, posts.to_string()).await.unwrap();

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let pipeline = ImportPipeline::new(store.clone())
        .with_default_parsers()
        .with_backend(backend.clone());

    let job = pipeline
        .run_import(&export, ImportOptions::default(), progress::channel(16).0)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.units_total, 2);

    let long_post = store
        .get_content_item("fb-post-1600000000-0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(long_post.source, "facebook");
    // The substantive post got a vector; the two-character one did not.
    let query = vector_for(&backend, "lake swimming").await;
    let hits = store
        .search_content_items(&query, 10, Some("post"), Some("facebook"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "fb-post-1600000000-0");
}

#[tokio::test]
async fn unrecognized_input_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mystery.bin");
    tokio::fs::write(&path, b"not an export").await.unwrap();

    let store = open_store(dir.path()).await;
    let pipeline = ImportPipeline::new(store).with_default_parsers();

    let err = pipeline
        .run_import(&path, ImportOptions::default(), progress::channel(4).0)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Invalid(_)));
}

#[tokio::test]
async fn skip_embeddings_persists_without_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("conversations.json");
    tokio::fs::write(&export, claude_export().to_string())
        .await
        .unwrap();

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let pipeline = ImportPipeline::new(store.clone())
        .with_default_parsers()
        .with_backend(backend.clone());

    let options = ImportOptions {
        skip_embeddings: true,
        ..Default::default()
    };
    let job = pipeline
        .run_import(&export, options, progress::channel(16).0)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(backend.embed_calls(), 0);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.embeddings, 0);
}

#[tokio::test]
async fn archive_folder_detection_beats_lower_confidence_parsers() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    write_archive_conversation(
        &archive,
        "2024-08-08-detected",
        "conv-det",
        &[("user", &substantive("detection"))],
    )
    .await;

    let store = open_store(dir.path()).await;
    let pipeline = ImportPipeline::new(store.clone()).with_default_parsers();

    let (parser, detection) = pipeline.detect(&archive).await.expect("archive detected");
    assert_eq!(parser.name(), "openai_archive");
    assert!(detection.confidence > 0.8);

    let job = pipeline
        .run_import(
            &archive,
            ImportOptions {
                skip_embeddings: true,
                ..Default::default()
            },
            progress::channel(16).0,
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(store.get_conversation("conv-det").await.unwrap().is_some());
}
