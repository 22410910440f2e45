//! Hybrid retrieval: ANN over chunk embeddings fused with BM25 over chunk
//! text by reciprocal-rank fusion.
//!
//! When the store has no FTS index the sparse pass is skipped transparently
//! and the fused score degrades to the dense similarity. A per-query
//! deadline yields best-effort partial results flagged as such rather than
//! an error.

use rustc_hash::FxHashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HybridConfig;
use crate::errors::Result;
use crate::store::{ArchiveStore, ChunkHit};

/// One fused result. Ranks are 1-based positions in the per-pass orderings;
/// a missing rank means the chunk only surfaced in the other pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedHit {
    pub chunk: ChunkHit,
    pub score: f64,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
}

/// Fusion output, flagged when a deadline truncated the passes.
#[derive(Clone, Debug, PartialEq)]
pub struct HybridResults {
    pub hits: Vec<FusedHit>,
    pub partial: bool,
}

/// Pure reciprocal-rank fusion over two ranked id lists.
///
/// `fused(id) = dense_weight · 1/(k + rank_dense) + sparse_weight ·
/// 1/(k + rank_sparse)`, with a missing rank contributing zero. Returns
/// `(id, score, dense_rank, sparse_rank)` sorted by score descending, ties
/// broken by id for determinism.
pub fn reciprocal_rank_fusion(
    dense_ids: &[String],
    sparse_ids: &[String],
    dense_weight: f64,
    sparse_weight: f64,
    fusion_k: f64,
) -> Vec<(String, f64, Option<usize>, Option<usize>)> {
    let mut dense_rank: FxHashMap<&str, usize> = FxHashMap::default();
    for (rank, id) in dense_ids.iter().enumerate() {
        dense_rank.entry(id.as_str()).or_insert(rank + 1);
    }
    let mut sparse_rank: FxHashMap<&str, usize> = FxHashMap::default();
    for (rank, id) in sparse_ids.iter().enumerate() {
        sparse_rank.entry(id.as_str()).or_insert(rank + 1);
    }

    let mut union: Vec<&str> = dense_ids.iter().map(String::as_str).collect();
    for id in sparse_ids {
        if !dense_rank.contains_key(id.as_str()) {
            union.push(id.as_str());
        }
    }

    let mut fused: Vec<(String, f64, Option<usize>, Option<usize>)> = union
        .into_iter()
        .map(|id| {
            let d = dense_rank.get(id).copied();
            let s = sparse_rank.get(id).copied();
            let score = d.map_or(0.0, |r| dense_weight / (fusion_k + r as f64))
                + s.map_or(0.0, |r| sparse_weight / (fusion_k + r as f64));
            (id.to_string(), score, d, s)
        })
        .collect();

    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

/// Hybrid search over the chunk grain of one store.
#[derive(Clone)]
pub struct HybridSearch {
    store: ArchiveStore,
    config: HybridConfig,
}

impl HybridSearch {
    pub fn new(store: ArchiveStore, config: HybridConfig) -> Self {
        Self { store, config }
    }

    /// Runs both passes and fuses them. `search_limit` bounds each pass;
    /// the fused list is cut to `limit`.
    pub async fn search(
        &self,
        query_text: &str,
        query_vector: &[f32],
        search_limit: usize,
        limit: usize,
        deadline: Option<Duration>,
    ) -> Result<HybridResults> {
        let run = self.run_passes(query_text, query_vector, search_limit, limit);
        match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(results) => results,
                Err(_) => {
                    // Deadline hit: fall back to whatever the dense pass
                    // alone can deliver quickly, flagged partial.
                    warn!("hybrid search deadline elapsed, returning dense-only partial");
                    let dense = self
                        .store
                        .search_chunks(query_vector, limit, None)
                        .await?;
                    Ok(HybridResults {
                        hits: dense_only(dense),
                        partial: true,
                    })
                }
            },
            None => run.await,
        }
    }

    async fn run_passes(
        &self,
        query_text: &str,
        query_vector: &[f32],
        search_limit: usize,
        limit: usize,
    ) -> Result<HybridResults> {
        let dense = self
            .store
            .search_chunks(query_vector, search_limit, None)
            .await?;
        let sparse = self.store.search_chunks_fts(query_text, search_limit).await?;
        debug!(dense = dense.len(), sparse = sparse.len(), "hybrid passes");

        if sparse.is_empty() {
            // No FTS index (or no lexical hits): fused score is the dense
            // similarity itself.
            let mut hits = dense_only(dense);
            hits.truncate(limit);
            return Ok(HybridResults {
                hits,
                partial: false,
            });
        }

        let dense_ids: Vec<String> = dense.iter().map(|h| h.id.clone()).collect();
        let sparse_ids: Vec<String> = sparse.iter().map(|h| h.chunk_id.clone()).collect();
        let fused = reciprocal_rank_fusion(
            &dense_ids,
            &sparse_ids,
            self.config.dense_weight,
            self.config.sparse_weight,
            self.config.fusion_k,
        );

        let by_id: FxHashMap<&str, &ChunkHit> =
            dense.iter().map(|h| (h.id.as_str(), h)).collect();

        let mut hits = Vec::with_capacity(limit.min(fused.len()));
        for (id, score, dense_rank, sparse_rank) in fused.into_iter().take(limit) {
            let chunk = match by_id.get(id.as_str()) {
                Some(hit) => (*hit).clone(),
                // Sparse-only hit: materialize the chunk row with a zero
                // dense similarity.
                None => match self.store.get_chunk(&id).await? {
                    Some(chunk) => ChunkHit {
                        id: chunk.id,
                        content: chunk.content,
                        similarity: 0.0,
                        thread_id: chunk.thread_id,
                        message_id: chunk.message_id,
                        chunk_index: chunk.chunk_index,
                        content_type: chunk.content_type,
                        word_count: chunk.word_count,
                        language: chunk.language,
                    },
                    None => continue,
                },
            };
            hits.push(FusedHit {
                chunk,
                score,
                dense_rank,
                sparse_rank,
            });
        }
        Ok(HybridResults {
            hits,
            partial: false,
        })
    }
}

fn dense_only(dense: Vec<ChunkHit>) -> Vec<FusedHit> {
    dense
        .into_iter()
        .enumerate()
        .map(|(rank, chunk)| FusedHit {
            score: chunk.similarity as f64,
            dense_rank: Some(rank + 1),
            sparse_rank: None,
            chunk,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dense_heavy_weights_favor_dense_winner() {
        // A leads the dense list and is absent from sparse; B is the unique
        // sparse hit and trails in dense.
        let dense = ids(&["a", "b"]);
        let sparse = ids(&["b"]);

        let fused = reciprocal_rank_fusion(&dense, &sparse, 0.6, 0.25, 60.0);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused.len(), 2);

        let flipped = reciprocal_rank_fusion(&dense, &sparse, 0.2, 0.8, 60.0);
        assert_eq!(flipped[0].0, "b");
        // Both chunks stay in the top two either way.
        assert_eq!(flipped.len(), 2);
    }

    #[test]
    fn missing_rank_contributes_zero() {
        let fused = reciprocal_rank_fusion(&ids(&["a"]), &[], 0.6, 0.25, 60.0);
        assert_eq!(fused.len(), 1);
        let expected = 0.6 / 61.0;
        assert!((fused[0].1 - expected).abs() < 1e-12);
        assert_eq!(fused[0].2, Some(1));
        assert_eq!(fused[0].3, None);
    }

    #[test]
    fn fusion_is_deterministic_under_ties() {
        let dense = ids(&["x", "y"]);
        let sparse = ids(&["y", "x"]);
        let first = reciprocal_rank_fusion(&dense, &sparse, 0.5, 0.5, 60.0);
        let second = reciprocal_rank_fusion(&dense, &sparse, 0.5, 0.5, 60.0);
        assert_eq!(first, second);
        // Symmetric ranks give equal scores; ties resolve by id.
        assert_eq!(first[0].0, "x");
    }
}
