//! End-to-end indexing runs over small on-disk archives with the mock
//! embedding backend.

mod common;

use common::*;
use palimpsest::errors::ArchiveError;
use palimpsest::indexer::{ArchiveIndexer, IndexPhase, IndexStatus, IndexerOptions};
use palimpsest::progress;

#[tokio::test]
async fn small_archive_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    write_archive_conversation(
        &archive,
        "2024-01-01-hello",
        "conv-hello",
        &[
            ("user", "Hello there, could you explain how sourdough fermentation works?"),
            ("assistant", "Fermentation happens when wild yeast and lactobacilli digest the flour's starches over several hours."),
        ],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store.clone(), backend.clone(), &test_config());

    let (sink, rx) = progress::channel(64);
    let outcome = indexer
        .index_archive(&archive, IndexerOptions::default(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.conversations, 1);
    assert_eq!(outcome.messages_embedded, 2);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.conversations, 1);
    // Root node plus the two authored turns.
    assert_eq!(stats.messages, 3);
    assert_eq!(stats.embeddings, 2);
    // Paragraph chunking is off by default.
    assert_eq!(stats.chunks, 0);

    // Both authored messages come back from a semantic query.
    let query = vector_for(&backend, "greeting").await;
    let hits = store.search_messages(&query, 10, None).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.similarity > 0.0));
    assert!(hits.iter().all(|h| h.conversation_id == "conv-hello"));

    // Progress ended in done with a completion stamp.
    let records: Vec<_> = rx.drain().collect();
    let last = records.last().unwrap();
    assert_eq!(last.status, IndexStatus::Done);
    assert_eq!(last.phase, IndexPhase::Done);
    assert!(last.completed_at_ms.is_some());
}

#[tokio::test]
async fn empty_archive_completes_with_zero_totals() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store.clone(), backend, &test_config());

    let (sink, rx) = progress::channel(64);
    let outcome = indexer
        .index_archive(&archive, IndexerOptions::default(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.conversations, 0);
    assert_eq!(outcome.messages_embedded, 0);
    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.conversations, 0);
    assert_eq!(stats.embeddings, 0);

    let extracting = rx
        .drain()
        .into_iter()
        .filter(|r| r.phase == IndexPhase::Extracting)
        .last()
        .unwrap();
    assert_eq!(extracting.total, 0);
    assert_eq!(extracting.current, 0);
}

#[tokio::test]
async fn junk_messages_never_reach_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    write_archive_conversation(
        &archive,
        "2024-02-02-junk",
        "conv-junk",
        &[
            ("user", "short text"), // 10 chars: junk
            ("assistant", "This reply is comfortably longer than the junk threshold and gets embedded."),
        ],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store.clone(), backend.clone(), &test_config());

    let outcome = indexer
        .index_archive(
            &archive,
            IndexerOptions::default(),
            progress::channel(16).0,
        )
        .await
        .unwrap();

    assert_eq!(outcome.messages_embedded, 1);
    assert!(outcome.junk_skipped >= 1);
    // Exactly one embed request served: the junk message produced none.
    assert_eq!(backend.embed_calls(), 1);

    let messages = store
        .get_messages_for_conversation("conv-junk")
        .await
        .unwrap();
    let short = messages.iter().find(|m| m.content == "short text").unwrap();
    assert!(short.embedding_id.is_none());
}

#[tokio::test]
async fn reindexing_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    write_archive_conversation(
        &archive,
        "2024-03-03-repeat",
        "conv-repeat",
        &[
            ("user", &substantive("indexing")),
            ("assistant", &substantive("batching")),
        ],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store.clone(), backend.clone(), &test_config());
    let options = IndexerOptions {
        include_paragraphs: true,
        ..Default::default()
    };

    indexer
        .index_archive(&archive, options.clone(), progress::channel(16).0)
        .await
        .unwrap();
    let first = store.get_stats().await.unwrap();
    let first_embedding = store
        .get_message_embedding("m0")
        .await
        .unwrap()
        .expect("first run embedded m0");

    let second_outcome = indexer
        .index_archive(&archive, options, progress::channel(16).0)
        .await
        .unwrap();
    let second = store.get_stats().await.unwrap();

    // No new rows, no re-embedding, identical vectors.
    assert_eq!(first, second);
    assert_eq!(second_outcome.messages_embedded, 0);
    assert_eq!(second_outcome.chunks_embedded, 0);
    let second_embedding = store.get_message_embedding("m0").await.unwrap().unwrap();
    assert_eq!(first_embedding, second_embedding);
}

#[tokio::test]
async fn paragraph_chunks_satisfy_offset_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    let body = format!(
        "{}\n\n{}\n\n```rust\nfn main() {{ println!(\"hi\"); }}\n```",
        substantive("chunk offsets"),
        substantive("a second paragraph")
    );
    write_archive_conversation(
        &archive,
        "2024-04-04-chunks",
        "conv-chunks",
        &[("assistant", &body)],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store.clone(), backend, &test_config());
    indexer
        .index_archive(
            &archive,
            IndexerOptions {
                include_paragraphs: true,
                ..Default::default()
            },
            progress::channel(16).0,
        )
        .await
        .unwrap();

    let message = store.get_message("m0").await.unwrap().unwrap();
    let chunks = store.get_chunks_for_message("m0").await.unwrap();
    assert!(chunks.len() >= 2);

    let mut seen_indices = std::collections::HashSet::new();
    for chunk in &chunks {
        // Chunk content is exactly the parent slice it claims.
        assert_eq!(
            &message.content[chunk.start_offset..chunk.end_offset],
            chunk.content
        );
        assert!(seen_indices.insert(chunk.chunk_index));
        assert!(chunk.embedding_id.is_some());
    }
    assert!(chunks
        .iter()
        .any(|c| c.content_type == palimpsest::model::ContentKind::Code));
}

#[tokio::test]
async fn oversize_retry_ladder_stores_partial_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    let long_body = substantive("retries");
    write_archive_conversation(
        &archive,
        "2024-05-05-retry",
        "conv-retry",
        &[("assistant", &long_body)],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    // Reject the full text and the half prefix; the quarter succeeds.
    backend.reject_oversize(&long_body[..16], 2);

    let indexer = ArchiveIndexer::new(store.clone(), backend, &test_config());
    let outcome = indexer
        .index_archive(
            &archive,
            IndexerOptions::default(),
            progress::channel(16).0,
        )
        .await
        .unwrap();

    assert_eq!(outcome.messages_embedded, 1);
    assert_eq!(outcome.embedding_failures, 0);
    assert!(store
        .get_message_embedding("m0")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unreachable_backend_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();

    let store = open_store(dir.path()).await;
    let backend = std::sync::Arc::new(
        palimpsest::embedding::MockEmbeddingBackend::unavailable(),
    );
    let indexer = ArchiveIndexer::new(store, backend, &test_config());

    let (sink, rx) = progress::channel(16);
    let err = indexer
        .index_archive(&archive, IndexerOptions::default(), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Backend { .. }));

    let last = rx.drain().into_iter().last().unwrap();
    assert_eq!(last.status, IndexStatus::Failed);
    assert!(last.error.is_some());
}

#[tokio::test]
async fn cancellation_is_cooperative() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    write_archive_conversation(
        &archive,
        "2024-06-06-cancel",
        "conv-cancel",
        &[("user", &substantive("cancellation"))],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store, backend, &test_config());
    // Cancel before the run starts: the first between-batches check trips.
    let flag = indexer.cancel_flag();

    let (sink, rx) = progress::channel(16);
    // The run resets the flag at entry, so set it from a racing task the
    // moment the first record arrives.
    let runner = indexer.index_archive(&archive, IndexerOptions::default(), sink);
    let watcher = async {
        while let Ok(record) = rx.recv_async().await {
            if record.phase == IndexPhase::Extracting {
                flag.store(true, std::sync::atomic::Ordering::Relaxed);
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(runner, watcher);
    let err = result.unwrap_err();
    assert!(matches!(err, ArchiveError::Cancelled));
}

#[tokio::test]
async fn summaries_are_written_once() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    tokio::fs::create_dir_all(&archive).await.unwrap();
    write_archive_conversation(
        &archive,
        "2024-07-07-summary",
        "conv-sum",
        &[
            ("user", &substantive("summaries")),
            ("assistant", &substantive("pyramids")),
        ],
    )
    .await;

    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let indexer = ArchiveIndexer::new(store.clone(), backend, &test_config());
    let options = IndexerOptions {
        summarize_conversations: true,
        ..Default::default()
    };

    let first = indexer
        .index_archive(&archive, options.clone(), progress::channel(16).0)
        .await
        .unwrap();
    assert_eq!(first.summaries_written, 1);

    let conversation = store.get_conversation("conv-sum").await.unwrap().unwrap();
    assert!(conversation.summary.as_deref().unwrap().starts_with("summary:"));
    assert!(conversation.summary_embedding_id.is_some());

    let second = indexer
        .index_archive(&archive, options, progress::channel(16).0)
        .await
        .unwrap();
    assert_eq!(second.summaries_written, 0);
}
