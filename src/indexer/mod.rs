//! The archive indexer: extraction → chunking → block extraction →
//! embedding → persistence, as one resumable state machine.
//!
//! ```text
//! idle → initializing → loading_model → extracting
//!      → embedding_messages → [embedding_paragraphs]
//!      → [extracting_content_blocks] → [summarizing] → done | failed
//! ```
//!
//! Re-running the indexer over the same archive is safe: conversations and
//! messages upsert by id, and only owners without an embedding are sent to
//! the backend, so a second run produces no new rows.
//!
//! Cancellation is cooperative. The flag is checked between batches; the
//! in-flight batch commits before the run winds down as `cancelled`.

mod progress;

pub use progress::{IndexPhase, IndexProgress, IndexStatus};

use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

use crate::analysis::{ChunkerConfig, chunk_plain, chunk_text, extract_blocks, is_junk};
use crate::config::{EmbeddingsConfig, PyramidConfig, ServiceConfig};
use crate::embedding::{EmbeddingBackend, centroid, l2_normalize, split_for_embedding};
use crate::errors::{ArchiveError, Result};
use crate::model::{Chunk, ContentBlock, Message, new_id, now_seconds};
use crate::progress::ProgressSender;
use crate::store::ArchiveStore;
use crate::walker::ConversationWalker;

use progress::ProgressTracker;

/// Knobs for one indexing run. Batch size is a throughput knob, never a
/// correctness knob.
#[derive(Clone, Debug)]
pub struct IndexerOptions {
    /// Only embed conversations already flagged interesting.
    pub interesting_only: bool,
    /// Produce chunk-grain units and embed them.
    pub include_paragraphs: bool,
    /// Additionally split prose chunks down to sentences.
    pub include_sentences: bool,
    /// Type-aware segmentation for chunking; plain paragraph packing
    /// otherwise.
    pub use_content_aware_chunking: bool,
    /// Extract and embed semantic content blocks.
    pub extract_content_blocks: bool,
    /// Generate conversation summaries through the backend.
    pub summarize_conversations: bool,
    pub batch_size: usize,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            interesting_only: false,
            include_paragraphs: false,
            include_sentences: false,
            use_content_aware_chunking: true,
            extract_content_blocks: true,
            summarize_conversations: false,
            batch_size: 32,
        }
    }
}

/// Counters for one finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub conversations: usize,
    pub messages_embedded: usize,
    pub chunks_created: usize,
    pub chunks_embedded: usize,
    pub blocks_created: usize,
    pub blocks_embedded: usize,
    pub summaries_written: usize,
    pub junk_skipped: usize,
    pub embedding_failures: usize,
}

/// Orchestrates extraction, chunking, block extraction, and embedding for
/// one archive.
pub struct ArchiveIndexer {
    store: ArchiveStore,
    backend: Arc<dyn EmbeddingBackend>,
    embeddings: EmbeddingsConfig,
    chunker: ChunkerConfig,
    pyramid: PyramidConfig,
    journal_gizmos: Vec<String>,
    cancel: Arc<AtomicBool>,
}

impl ArchiveIndexer {
    pub fn new(
        store: ArchiveStore,
        backend: Arc<dyn EmbeddingBackend>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            backend,
            embeddings: config.embeddings.clone(),
            chunker: ChunkerConfig::default(),
            pyramid: config.pyramid.clone(),
            journal_gizmos: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Gizmo ids whose conversations are whole-message transcriptions.
    #[must_use]
    pub fn with_journal_gizmos(mut self, gizmos: Vec<String>) -> Self {
        self.journal_gizmos = gizmos;
        self
    }

    /// Shared cancel flag; set it from any task to stop between batches.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs the full pipeline over `root`, emitting progress on `sink`.
    #[instrument(skip(self, root, options, sink), fields(root = %root.as_ref().display()))]
    pub async fn index_archive(
        &self,
        root: impl AsRef<Path>,
        options: IndexerOptions,
        sink: ProgressSender<IndexProgress>,
    ) -> Result<IndexOutcome> {
        self.cancel.store(false, Ordering::Relaxed);
        let mut tracker = ProgressTracker::start(sink);
        match self.run(root.as_ref(), &options, &mut tracker).await {
            Ok(outcome) => {
                tracker.done();
                info!(?outcome, "indexing complete");
                Ok(outcome)
            }
            Err(err) => {
                let cancelled = matches!(err, ArchiveError::Cancelled);
                tracker.failed(err.to_string(), cancelled);
                Err(err)
            }
        }
    }

    /// Embedding-only entry point for conversations that are already in
    /// the store (import units that did not come from an archive walk).
    pub async fn index_conversations(
        &self,
        conversation_ids: &[String],
        options: IndexerOptions,
        sink: ProgressSender<IndexProgress>,
    ) -> Result<IndexOutcome> {
        self.cancel.store(false, Ordering::Relaxed);
        let mut tracker = ProgressTracker::start(sink);
        match self
            .run_conversations(conversation_ids, &options, &mut tracker)
            .await
        {
            Ok(outcome) => {
                tracker.done();
                Ok(outcome)
            }
            Err(err) => {
                let cancelled = matches!(err, ArchiveError::Cancelled);
                tracker.failed(err.to_string(), cancelled);
                Err(err)
            }
        }
    }

    async fn run_conversations(
        &self,
        conversation_ids: &[String],
        options: &IndexerOptions,
        tracker: &mut ProgressTracker,
    ) -> Result<IndexOutcome> {
        let mut outcome = IndexOutcome::default();
        let mut indexed: Vec<(String, Option<String>)> = Vec::new();
        for id in conversation_ids {
            let gizmo = self.store.get_conversation(id).await?.and_then(|c| {
                c.metadata
                    .get("gizmoId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });
            indexed.push((id.clone(), gizmo));
        }
        outcome.conversations = indexed.len();

        self.embed_messages(&indexed, options, tracker, &mut outcome)
            .await?;
        if options.include_paragraphs {
            self.embed_paragraphs(&indexed, options, tracker, &mut outcome)
                .await?;
        }
        if options.extract_content_blocks {
            self.extract_and_embed_blocks(&indexed, options, tracker, &mut outcome)
                .await?;
        }
        if options.summarize_conversations {
            self.summarize(&indexed, tracker, &mut outcome).await?;
        }
        Ok(outcome)
    }

    async fn run(
        &self,
        root: &Path,
        options: &IndexerOptions,
        tracker: &mut ProgressTracker,
    ) -> Result<IndexOutcome> {
        let mut outcome = IndexOutcome::default();

        tracker.phase(IndexPhase::LoadingModel, 1);
        if !self.backend.is_available().await {
            return Err(ArchiveError::backend_unreachable(
                "embedding backend is not reachable",
                5_000,
            ));
        }
        tracker.tick(1, None);

        // Extraction: walk the archive, upsert conversations and messages.
        let walker = ConversationWalker::new(root);
        let folders = walker.discover_folders().await?;
        tracker.phase(IndexPhase::Extracting, folders.len());

        let mut indexed: Vec<(String, Option<String>)> = Vec::new();
        let mut stream = Box::pin(walker.walk().await?);
        let mut extracted = 0usize;
        while let Some((conversation, messages)) = stream.next().await {
            self.check_cancel()?;
            let gizmo = conversation
                .metadata
                .get("gizmoId")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            self.store.insert_conversation(&conversation).await?;
            self.store.insert_messages_batch(messages).await?;

            let include = if options.interesting_only {
                self.store
                    .get_conversation(&conversation.id)
                    .await?
                    .map(|c| c.is_interesting)
                    .unwrap_or(false)
            } else {
                true
            };
            if include {
                indexed.push((conversation.id.clone(), gizmo));
            }
            extracted += 1;
            tracker.tick(extracted, Some(conversation.folder.clone()));
            outcome.conversations += 1;
        }

        self.embed_messages(&indexed, options, tracker, &mut outcome)
            .await?;

        if options.include_paragraphs {
            self.embed_paragraphs(&indexed, options, tracker, &mut outcome)
                .await?;
        }

        if options.extract_content_blocks {
            self.extract_and_embed_blocks(&indexed, options, tracker, &mut outcome)
                .await?;
        }

        if options.summarize_conversations {
            self.summarize(&indexed, tracker, &mut outcome).await?;
        }

        Ok(outcome)
    }

    async fn embed_messages(
        &self,
        indexed: &[(String, Option<String>)],
        options: &IndexerOptions,
        tracker: &mut ProgressTracker,
        outcome: &mut IndexOutcome,
    ) -> Result<()> {
        // Pre-pass: everything that still needs a vector, per conversation.
        let mut pending: Vec<Message> = Vec::new();
        for (conversation_id, _) in indexed {
            for message in self
                .store
                .get_messages_for_conversation(conversation_id)
                .await?
            {
                if message.embedding_id.is_some() {
                    continue;
                }
                if is_junk(message.role, &message.content) {
                    outcome.junk_skipped += 1;
                    continue;
                }
                pending.push(message);
            }
        }

        tracker.phase(IndexPhase::EmbeddingMessages, pending.len());
        let mut processed = 0usize;
        for batch in pending.chunks(options.batch_size.max(1)) {
            self.check_cancel()?;
            let texts: Vec<String> = batch.iter().map(|m| m.content.clone()).collect();
            let vectors = self.embed_texts(&texts).await?;

            let mut rows = Vec::new();
            for (message, vector) in batch.iter().zip(vectors) {
                match vector {
                    Some(vector) => rows.push((message.id.clone(), vector)),
                    None => outcome.embedding_failures += 1,
                }
            }
            outcome.messages_embedded += rows.len();
            self.store.insert_message_embeddings_batch(rows).await?;

            processed += batch.len();
            tracker.tick(processed, batch.last().map(|m| m.id.clone()));
        }
        Ok(())
    }

    async fn embed_paragraphs(
        &self,
        indexed: &[(String, Option<String>)],
        options: &IndexerOptions,
        tracker: &mut ProgressTracker,
        outcome: &mut IndexOutcome,
    ) -> Result<()> {
        tracker.phase(IndexPhase::EmbeddingParagraphs, indexed.len());

        for (position, (conversation_id, _)) in indexed.iter().enumerate() {
            self.check_cancel()?;
            let messages = self
                .store
                .get_messages_for_conversation(conversation_id)
                .await?;
            let mut next_index = self
                .store
                .max_chunk_index(conversation_id)
                .await?
                .map(|max| max + 1)
                .unwrap_or(0);

            let mut new_chunks: Vec<Chunk> = Vec::new();
            for message in &messages {
                if is_junk(message.role, &message.content) {
                    continue;
                }
                if !self
                    .store
                    .get_chunks_for_message(&message.id)
                    .await?
                    .is_empty()
                {
                    continue;
                }
                let pieces = if options.use_content_aware_chunking {
                    chunk_text(&message.content, &self.chunker)
                } else {
                    chunk_plain(&message.content, &self.chunker)
                };
                for piece in pieces {
                    if options.include_sentences {
                        // Sentence grain rides along as extra chunks.
                        for (s_start, s_end) in sentence_spans(&message.content, &piece) {
                            new_chunks.push(self.piece_to_chunk(
                                conversation_id,
                                &message.id,
                                &mut next_index,
                                &message.content[s_start..s_end],
                                s_start,
                                s_end,
                                &piece,
                            ));
                        }
                    }
                    let (start, end) = (piece.start_offset, piece.end_offset);
                    new_chunks.push(self.piece_to_chunk(
                        conversation_id,
                        &message.id,
                        &mut next_index,
                        &piece.content.clone(),
                        start,
                        end,
                        &piece,
                    ));
                }
            }

            outcome.chunks_created += new_chunks.len();
            self.store.insert_chunks_batch(new_chunks).await?;

            // Embed whatever chunks still lack vectors, message by message.
            let mut pending: Vec<Chunk> = Vec::new();
            for message in &messages {
                for chunk in self.store.get_chunks_for_message(&message.id).await? {
                    if chunk.embedding_id.is_none() {
                        pending.push(chunk);
                    }
                }
            }
            for batch in pending.chunks(options.batch_size.max(1)) {
                self.check_cancel()?;
                let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
                let vectors = self.embed_texts(&texts).await?;
                let mut rows = Vec::new();
                for (chunk, vector) in batch.iter().zip(vectors) {
                    match vector {
                        Some(vector) => rows.push((chunk.id.clone(), vector)),
                        None => outcome.embedding_failures += 1,
                    }
                }
                outcome.chunks_embedded += rows.len();
                self.store.insert_chunk_embeddings_batch(rows).await?;
            }

            tracker.tick(position + 1, Some(conversation_id.clone()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn piece_to_chunk(
        &self,
        conversation_id: &str,
        message_id: &str,
        next_index: &mut i64,
        content: &str,
        start: usize,
        end: usize,
        piece: &crate::analysis::ChunkPiece,
    ) -> Chunk {
        let index = *next_index;
        *next_index += 1;
        Chunk {
            id: new_id(),
            thread_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            chunk_index: index,
            content: content.to_string(),
            word_count: unicode_words(content),
            token_count: (content.chars().count().div_ceil(4)) as i64,
            content_type: piece.content_type,
            language: piece.language.clone(),
            start_offset: start,
            end_offset: end,
            context_before: piece.context_before.clone(),
            context_after: piece.context_after.clone(),
            embedding_id: None,
        }
    }

    async fn extract_and_embed_blocks(
        &self,
        indexed: &[(String, Option<String>)],
        options: &IndexerOptions,
        tracker: &mut ProgressTracker,
        outcome: &mut IndexOutcome,
    ) -> Result<()> {
        tracker.phase(IndexPhase::ExtractingContentBlocks, indexed.len());

        for (position, (conversation_id, gizmo)) in indexed.iter().enumerate() {
            self.check_cancel()?;
            let messages = self
                .store
                .get_messages_for_conversation(conversation_id)
                .await?;

            let mut new_blocks: Vec<ContentBlock> = Vec::new();
            for message in &messages {
                if is_junk(message.role, &message.content) {
                    continue;
                }
                if !self
                    .store
                    .get_blocks_for_message(&message.id)
                    .await?
                    .is_empty()
                {
                    continue;
                }
                for extracted in
                    extract_blocks(&message.content, gizmo.as_deref(), &self.journal_gizmos)
                {
                    new_blocks.extend(self.materialize_block(
                        conversation_id,
                        &message.id,
                        gizmo.as_deref(),
                        extracted,
                    ));
                }
            }
            outcome.blocks_created += new_blocks.len();
            self.store.insert_content_blocks_batch(new_blocks).await?;

            // Embed per message; a failed block keeps its row and gets
            // flagged instead of aborting the run.
            let mut pending: Vec<ContentBlock> = Vec::new();
            for message in &messages {
                for block in self.store.get_blocks_for_message(&message.id).await? {
                    if block.embedding_id.is_none()
                        && block.metadata.get("embeddingFailed").is_none()
                    {
                        pending.push(block);
                    }
                }
            }
            for batch in pending.chunks(options.batch_size.max(1)) {
                self.check_cancel()?;
                let texts: Vec<String> = batch.iter().map(|b| b.content.clone()).collect();
                let vectors = self.embed_texts(&texts).await?;
                let mut rows = Vec::new();
                for (block, vector) in batch.iter().zip(vectors) {
                    match vector {
                        Some(vector) => rows.push((block.id.clone(), vector)),
                        None => {
                            outcome.embedding_failures += 1;
                            self.store.mark_block_embedding_failed(&block.id).await?;
                        }
                    }
                }
                outcome.blocks_embedded += rows.len();
                self.store.insert_content_block_embeddings_batch(rows).await?;
            }

            tracker.tick(position + 1, Some(conversation_id.clone()));
        }
        Ok(())
    }

    /// Turns one extracted block into stored rows, splitting oversize
    /// content into sibling blocks that share provenance.
    fn materialize_block(
        &self,
        conversation_id: &str,
        message_id: &str,
        gizmo: Option<&str>,
        extracted: crate::analysis::ExtractedBlock,
    ) -> Vec<ContentBlock> {
        let created_at = now_seconds();
        let base = ContentBlock {
            id: new_id(),
            parent_message_id: message_id.to_string(),
            parent_conversation_id: conversation_id.to_string(),
            block_type: extracted.kind,
            language: extracted.language,
            content: extracted.content,
            start_offset: extracted.start_offset,
            end_offset: extracted.end_offset,
            gizmo_id: gizmo.map(str::to_string),
            created_at,
            metadata: extracted.metadata,
            embedding_id: None,
        };

        if base.content.chars().count() <= self.embeddings.max_chunk_chars {
            return vec![base];
        }

        let parent_block_id = base.id.clone();
        split_for_embedding(&base.content, self.embeddings.target_chunk_chars)
            .into_iter()
            .enumerate()
            .map(|(index, piece)| {
                let mut metadata = base.metadata.clone();
                if let serde_json::Value::Object(map) = &mut metadata {
                    map.insert("parentBlockId".into(), parent_block_id.clone().into());
                    map.insert("chunkIndex".into(), (index as i64).into());
                }
                ContentBlock {
                    id: new_id(),
                    content: piece,
                    metadata,
                    ..base.clone()
                }
            })
            .collect()
    }

    async fn summarize(
        &self,
        indexed: &[(String, Option<String>)],
        tracker: &mut ProgressTracker,
        outcome: &mut IndexOutcome,
    ) -> Result<()> {
        tracker.phase(IndexPhase::Summarizing, indexed.len());

        for (position, (conversation_id, _)) in indexed.iter().enumerate() {
            self.check_cancel()?;
            let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
                continue;
            };
            if conversation.summary.is_some() {
                tracker.tick(position + 1, None);
                continue;
            }
            let messages = self
                .store
                .get_messages_for_conversation(conversation_id)
                .await?;
            let body: Vec<String> = messages
                .iter()
                .filter(|m| !is_junk(m.role, &m.content))
                .take(self.pyramid.chunks_per_summary)
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect();
            if body.is_empty() {
                tracker.tick(position + 1, None);
                continue;
            }
            let prompt = format!(
                "Summarize this conversation in at most {} words:\n\n{}",
                self.pyramid.target_summary_words,
                body.join("\n\n")
            );
            match self.backend.summarize(&prompt).await {
                Ok(summary) => {
                    self.store
                        .update_conversation_summary(conversation_id, &summary, None)
                        .await?;
                    match self.embed_texts(std::slice::from_ref(&summary)).await {
                        Ok(vectors) => {
                            if let Some(Some(vector)) = vectors.into_iter().next() {
                                self.store
                                    .insert_summary_embedding(conversation_id, &vector)
                                    .await?;
                            }
                        }
                        Err(err) => {
                            warn!(conversation = conversation_id, error = %err, "summary embedding failed");
                            outcome.embedding_failures += 1;
                        }
                    }
                    outcome.summaries_written += 1;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(conversation = conversation_id, error = %err, "summarization failed");
                }
            }
            tracker.tick(position + 1, Some(conversation_id.clone()));
        }
        Ok(())
    }

    /// Embeds a batch, aligned with the input: `None` marks a text whose
    /// embedding was omitted after the retry ladder gave up.
    ///
    /// Texts above the configured ceiling are split by the shared policy
    /// and mean-pooled. Backend transport failures propagate; only
    /// context-length exhaustion degrades to `None`.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        let mut batched: Vec<(usize, &String)> = Vec::new();
        for (index, text) in texts.iter().enumerate() {
            if text.chars().count() > self.embeddings.max_chunk_chars {
                results[index] = self.embed_pooled(text).await?;
            } else {
                batched.push((index, text));
            }
        }

        if batched.is_empty() {
            return Ok(results);
        }

        let payload: Vec<String> = batched.iter().map(|(_, t)| (*t).clone()).collect();
        match self.backend.embed_batch(&payload).await {
            Ok(vectors) => {
                for ((index, _), mut vector) in batched.into_iter().zip(vectors) {
                    l2_normalize(&mut vector);
                    results[index] = Some(vector);
                }
            }
            Err(err) if err.is_context_too_long() => {
                // One oversized member poisons a whole batch; retry each
                // text through the ladder.
                debug!("batch rejected for length, retrying per text");
                for (index, text) in batched {
                    match self.backend.embed_resilient(text).await {
                        Ok(mut vector) => {
                            l2_normalize(&mut vector);
                            results[index] = Some(vector);
                        }
                        Err(err) if err.is_context_too_long() => {
                            warn!("embedding omitted after retry ladder");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) => return Err(err),
        }
        Ok(results)
    }

    async fn embed_pooled(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let pieces = split_for_embedding(text, self.embeddings.target_chunk_chars);
        let mut vectors = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            match self.backend.embed_resilient(piece).await {
                Ok(vector) => vectors.push(vector),
                Err(err) if err.is_context_too_long() => {}
                Err(err) => return Err(err),
            }
        }
        if vectors.is_empty() {
            return Ok(None);
        }
        Ok(Some(centroid(&vectors)?))
    }
}

fn unicode_words(text: &str) -> i64 {
    use unicode_segmentation::UnicodeSegmentation;
    text.unicode_words().count() as i64
}

/// Sentence spans inside one prose piece, as offsets into the full message
/// text. Non-prose pieces yield nothing.
fn sentence_spans(
    message: &str,
    piece: &crate::analysis::ChunkPiece,
) -> Vec<(usize, usize)> {
    use unicode_segmentation::UnicodeSegmentation;
    if piece.content_type != crate::model::ContentKind::Prose {
        return Vec::new();
    }
    let slice = &message[piece.start_offset..piece.end_offset];
    let mut spans = Vec::new();
    let mut cursor = piece.start_offset;
    for sentence in slice.split_sentence_bounds() {
        let start = cursor;
        cursor += sentence.len();
        if sentence.trim().is_empty() {
            continue;
        }
        spans.push((start, cursor));
    }
    // A single-sentence piece would duplicate the piece itself.
    if spans.len() <= 1 { Vec::new() } else { spans }
}
