//! Quality-gated agentic retrieval.
//!
//! A harvest run searches wide (hybrid over chunks, dense over messages and
//! content items), then walks the merged candidate list through a quality
//! gate: stub classification, quick grading, optional breadcrumb expansion,
//! and de-duplication. It stops when the target count is reached or the
//! candidates run dry; a thin corpus yields `stats.exhausted = true`,
//! never an error.
//!
//! Progress streams over a bounded channel
//! (`searching → grading → expanding → complete`); the cancel flag is
//! checked between candidates.

mod dedup;
mod grade;

pub use dedup::Deduplicator;
pub use grade::{QuickGrade, StubKind, classify_stub, grade};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, instrument};

use crate::config::{DeduplicationConfig, HarvestConfig, HybridConfig};
use crate::embedding::{EmbeddingBackend, l2_normalize};
use crate::errors::{ArchiveError, Result};
use crate::progress::ProgressSender;
use crate::search::HybridSearch;
use crate::store::ArchiveStore;

/// Content-length floor for chunk and social candidates. Conversation
/// messages are exempt: short messages are exactly what breadcrumb
/// expansion exists for.
const MIN_CANDIDATE_CHARS: usize = 200;

/// Where a candidate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    Conversation,
    Chunk,
    Social,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestOptions {
    pub target: usize,
    pub search_limit: usize,
    pub min_word_count: usize,
    pub expand_breadcrumbs: bool,
    pub context_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    pub prioritize_conversations: bool,
    pub min_grade: f64,
    pub length_bonus_max: f64,
    pub length_bonus_divisor: f64,
    pub use_hybrid_search: bool,
    pub deduplication: DeduplicationConfig,
}

impl From<&HarvestConfig> for HarvestOptions {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            target: config.default_target,
            search_limit: config.search_limit,
            min_word_count: config.min_word_count,
            expand_breadcrumbs: config.expand_breadcrumbs,
            context_size: config.context_size,
            sources: None,
            types: None,
            prioritize_conversations: config.prioritize_conversations,
            min_grade: config.min_grade,
            length_bonus_max: config.length_bonus_max,
            length_bonus_divisor: config.length_bonus_divisor,
            use_hybrid_search: config.use_hybrid_search,
            deduplication: config.deduplication.clone(),
        }
    }
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestPhase {
    Searching,
    Grading,
    Expanding,
    Complete,
}

/// Progress record streamed to the caller (e.g. over SSE).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestProgress {
    pub phase: HarvestPhase,
    pub searched: usize,
    pub graded: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub expanded: usize,
    pub target: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Neighboring messages spliced around an accepted breadcrumb.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedContext {
    pub combined_content: String,
    pub message_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestResult {
    pub id: String,
    pub content: String,
    pub similarity: f32,
    pub word_count: usize,
    pub grade: QuickGrade,
    pub origin: CandidateOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded: Option<ExpandedContext>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestStats {
    pub searched: usize,
    pub graded: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub expanded: usize,
    pub exhausted: bool,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Harvest {
    pub results: Vec<HarvestResult>,
    pub stats: HarvestStats,
}

struct Candidate {
    id: String,
    content: String,
    similarity: f32,
    origin: CandidateOrigin,
    conversation_id: Option<String>,
    conversation_title: Option<String>,
    message_id: Option<String>,
    source: Option<String>,
}

/// The harvest service handle.
pub struct HarvestService {
    store: ArchiveStore,
    backend: Arc<dyn EmbeddingBackend>,
    hybrid: HybridSearch,
    cancel: Arc<AtomicBool>,
}

impl HarvestService {
    pub fn new(
        store: ArchiveStore,
        backend: Arc<dyn EmbeddingBackend>,
        hybrid_config: HybridConfig,
    ) -> Self {
        let hybrid = HybridSearch::new(store.clone(), hybrid_config);
        Self {
            store,
            backend,
            hybrid,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Runs one harvest.
    #[instrument(skip(self, options, sink), fields(target = options.target))]
    pub async fn harvest(
        &self,
        query: &str,
        options: HarvestOptions,
        sink: ProgressSender<HarvestProgress>,
    ) -> Result<Harvest> {
        self.cancel.store(false, Ordering::Relaxed);
        let started = Instant::now();
        let mut stats = HarvestStats::default();

        // A zero target needs no search at all.
        if options.target == 0 {
            stats.exhausted = true;
            stats.duration_ms = started.elapsed().as_millis() as u64;
            emit(&sink, HarvestPhase::Complete, &stats, &options, None);
            return Ok(Harvest {
                results: Vec::new(),
                stats,
            });
        }

        emit(&sink, HarvestPhase::Searching, &stats, &options, None);
        let mut query_vector = self.backend.embed(query).await?;
        l2_normalize(&mut query_vector);

        let mut candidates = self.gather(query, &query_vector, &options).await?;
        stats.searched = candidates.len();
        sort_candidates(&mut candidates, &options);
        emit(&sink, HarvestPhase::Grading, &stats, &options, None);

        let mut dedup = Deduplicator::new(&options.deduplication);
        let mut results: Vec<HarvestResult> = Vec::new();

        for candidate in candidates {
            if results.len() >= options.target {
                break;
            }
            if self.cancel.load(Ordering::Relaxed) {
                return Err(ArchiveError::Cancelled);
            }

            stats.graded += 1;
            let mut quality = grade(&candidate.content);
            let mut content = candidate.content.clone();
            let mut expanded_context: Option<ExpandedContext> = None;

            if quality.stub_kind == StubKind::Breadcrumb
                && options.expand_breadcrumbs
                && candidate.conversation_id.is_some()
                && candidate.message_id.is_some()
            {
                emit(
                    &sink,
                    HarvestPhase::Expanding,
                    &stats,
                    &options,
                    Some(candidate.id.clone()),
                );
                if let Some(expansion) = self
                    .expand_breadcrumb(
                        candidate.conversation_id.as_deref().unwrap_or_default(),
                        candidate.message_id.as_deref().unwrap_or_default(),
                        options.context_size,
                    )
                    .await?
                {
                    let expanded_grade = grade(&expansion.combined_content);
                    if expanded_grade.word_count >= options.min_word_count {
                        stats.expanded += 1;
                        content = expansion.combined_content.clone();
                        quality = expanded_grade;
                        expanded_context = Some(expansion);
                    }
                }
            }

            if quality.overall < options.min_grade || quality.word_count < options.min_word_count {
                stats.rejected += 1;
                continue;
            }
            if dedup.is_duplicate(&content) {
                stats.rejected += 1;
                continue;
            }

            stats.accepted += 1;
            results.push(HarvestResult {
                id: candidate.id,
                content,
                similarity: candidate.similarity,
                word_count: quality.word_count,
                grade: quality,
                origin: candidate.origin,
                conversation_id: candidate.conversation_id,
                conversation_title: candidate.conversation_title,
                source: candidate.source,
                expanded: expanded_context,
            });
        }

        stats.exhausted = results.len() < options.target;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        emit(&sink, HarvestPhase::Complete, &stats, &options, None);
        debug!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            exhausted = stats.exhausted,
            "harvest finished"
        );
        Ok(Harvest { results, stats })
    }

    /// Gathers candidates from all three grains.
    async fn gather(
        &self,
        query: &str,
        query_vector: &[f32],
        options: &HarvestOptions,
    ) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = Vec::new();
        let wide = options.search_limit * 3;

        if options.use_hybrid_search {
            let fused = self
                .hybrid
                .search(query, query_vector, wide, wide, None)
                .await?;
            for hit in fused.hits {
                if hit.chunk.content.len() < MIN_CANDIDATE_CHARS {
                    continue;
                }
                candidates.push(Candidate {
                    id: hit.chunk.id,
                    content: hit.chunk.content,
                    similarity: hit.chunk.similarity,
                    origin: CandidateOrigin::Chunk,
                    conversation_id: Some(hit.chunk.thread_id),
                    conversation_title: None,
                    message_id: Some(hit.chunk.message_id),
                    source: None,
                });
            }
        } else {
            for hit in self.store.search_chunks(query_vector, wide, None).await? {
                if hit.content.len() < MIN_CANDIDATE_CHARS {
                    continue;
                }
                candidates.push(Candidate {
                    id: hit.id,
                    content: hit.content,
                    similarity: hit.similarity,
                    origin: CandidateOrigin::Chunk,
                    conversation_id: Some(hit.thread_id),
                    conversation_title: None,
                    message_id: Some(hit.message_id),
                    source: None,
                });
            }
        }

        for hit in self
            .store
            .search_messages(query_vector, options.search_limit, None)
            .await?
        {
            candidates.push(Candidate {
                id: hit.id.clone(),
                content: hit.content,
                similarity: hit.similarity,
                origin: CandidateOrigin::Conversation,
                conversation_id: Some(hit.conversation_id),
                conversation_title: Some(hit.conversation_title),
                message_id: Some(hit.id),
                source: None,
            });
        }

        for hit in self
            .store
            .search_content_items(query_vector, options.search_limit, None, None)
            .await?
        {
            if let Some(types) = &options.types {
                if !types.contains(&hit.item_type) {
                    continue;
                }
            }
            if let Some(sources) = &options.sources {
                if !sources.contains(&hit.source) {
                    continue;
                }
            }
            let content = hit.text.unwrap_or_default();
            if content.len() < MIN_CANDIDATE_CHARS {
                continue;
            }
            candidates.push(Candidate {
                id: hit.id,
                content,
                similarity: hit.similarity,
                origin: CandidateOrigin::Social,
                conversation_id: None,
                conversation_title: hit.title,
                message_id: None,
                source: Some(hit.source),
            });
        }

        // The same message can surface through multiple grains; keep the
        // first (highest-priority) occurrence of each id.
        let mut seen = rustc_hash::FxHashSet::default();
        candidates.retain(|c| seen.insert(c.id.clone()));
        Ok(candidates)
    }

    /// Splices `±context_size` neighbors around a breadcrumb message.
    async fn expand_breadcrumb(
        &self,
        conversation_id: &str,
        message_id: &str,
        context_size: usize,
    ) -> Result<Option<ExpandedContext>> {
        let messages = self
            .store
            .get_messages_for_conversation(conversation_id)
            .await?;
        let Some(position) = messages.iter().position(|m| m.id == message_id) else {
            return Ok(None);
        };
        let start = position.saturating_sub(context_size);
        let end = (position + context_size + 1).min(messages.len());
        let window = &messages[start..end];

        let combined_content = window
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let message_ids = window.iter().map(|m| m.id.clone()).collect();

        Ok(Some(ExpandedContext {
            combined_content,
            message_ids,
        }))
    }
}

/// Ordering: similarity plus a capped length bonus, conversation-derived
/// results above social ones at equal score, id as the final tiebreak.
fn sort_candidates(candidates: &mut [Candidate], options: &HarvestOptions) {
    let score = |c: &Candidate| -> f64 {
        let words = c.content.split_whitespace().count() as f64;
        c.similarity as f64 + (words / options.length_bonus_divisor).min(options.length_bonus_max)
    };
    candidates.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                if options.prioritize_conversations {
                    origin_rank(a.origin).cmp(&origin_rank(b.origin))
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn origin_rank(origin: CandidateOrigin) -> u8 {
    match origin {
        CandidateOrigin::Conversation => 0,
        CandidateOrigin::Chunk => 1,
        CandidateOrigin::Social => 2,
    }
}

fn emit(
    sink: &ProgressSender<HarvestProgress>,
    phase: HarvestPhase,
    stats: &HarvestStats,
    options: &HarvestOptions,
    message: Option<String>,
) {
    sink.emit(HarvestProgress {
        phase,
        searched: stats.searched,
        graded: stats.graded,
        accepted: stats.accepted,
        rejected: stats.rejected,
        expanded: stats.expanded,
        target: options.target,
        message,
    });
}
