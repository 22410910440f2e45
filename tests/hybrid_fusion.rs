//! Hybrid search over a real store: dense/sparse interplay and weight
//! sensitivity.

mod common;

use common::*;
use palimpsest::config::HybridConfig;
use palimpsest::model::{Chunk, ContentKind, Role};
use palimpsest::search::HybridSearch;

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

async fn seed_two_chunks(
    store: &palimpsest::store::ArchiveStore,
    backend: &palimpsest::embedding::MockEmbeddingBackend,
) -> Vec<f32> {
    seed_conversation(
        store,
        "conv-f",
        "Fusion",
        &[("m-f", Role::Assistant, "host message for the fusion chunks")],
    )
    .await;

    // Chunk A: semantically close to the query, no keyword overlap.
    store
        .insert_chunk(&chunk(
            "chunk-a",
            "conv-f",
            "m-f",
            0,
            "Thoughts on retrieval quality and ranking behavior in general.",
        ))
        .await
        .unwrap();
    // Chunk B: lexically unique match for the query keyword.
    store
        .insert_chunk(&chunk(
            "chunk-b",
            "conv-f",
            "m-f",
            1,
            "The xylograph collection was catalogued last spring.",
        ))
        .await
        .unwrap();

    let query_vector = vector_for(backend, "ranking quality").await;
    store
        .insert_chunk_embedding("chunk-a", &query_vector)
        .await
        .unwrap();
    store
        .insert_chunk_embedding("chunk-b", &vector_for(backend, "entirely different").await)
        .await
        .unwrap();
    query_vector
}

#[tokio::test]
async fn weights_decide_the_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let query_vector = seed_two_chunks(&store, &backend).await;

    // Dense pass capped at one result so chunk B only enters via FTS.
    let dense_heavy = HybridSearch::new(store.clone(), HybridConfig::default());
    let results = dense_heavy
        .search("xylograph", &query_vector, 1, 10, None)
        .await
        .unwrap();
    assert!(!results.partial);
    assert_eq!(results.hits.len(), 2);
    assert_eq!(results.hits[0].chunk.id, "chunk-a");
    assert_eq!(results.hits[1].chunk.id, "chunk-b");
    assert_eq!(results.hits[1].dense_rank, None);
    assert_eq!(results.hits[1].sparse_rank, Some(1));

    let sparse_heavy = HybridSearch::new(
        store.clone(),
        HybridConfig {
            dense_weight: 0.2,
            sparse_weight: 0.8,
            ..Default::default()
        },
    );
    let results = sparse_heavy
        .search("xylograph", &query_vector, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(results.hits[0].chunk.id, "chunk-b");
    assert_eq!(results.hits[1].chunk.id, "chunk-a");
}

#[tokio::test]
async fn no_lexical_hits_degrades_to_dense_scores() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    let query_vector = seed_two_chunks(&store, &backend).await;

    let hybrid = HybridSearch::new(store, HybridConfig::default());
    // Query terms that match nothing lexically.
    let results = hybrid
        .search("zzznothing matches this", &query_vector, 10, 10, None)
        .await
        .unwrap();
    assert_eq!(results.hits.len(), 2);
    assert_eq!(results.hits[0].chunk.id, "chunk-a");
    // Fused score equals the dense similarity when sparse is silent.
    let top = &results.hits[0];
    assert!((top.score - top.chunk.similarity as f64).abs() < 1e-6);
    assert_eq!(top.sparse_rank, None);
}

#[tokio::test]
async fn sparse_results_respect_bm25_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let backend = mock_backend();
    seed_two_chunks(&store, &backend).await;

    let hits = store.search_chunks_fts("xylograph", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, "chunk-b");

    let nothing = store.search_chunks_fts("", 10).await.unwrap();
    assert!(nothing.is_empty());
}
