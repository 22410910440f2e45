//! The import pipeline: format detection, parsing, persistence, and
//! hand-off to the indexer for vectorization.
//!
//! Parsers register against the pipeline; the detector asks each one for a
//! confidence and picks the highest, breaking ties by registration order.
//! The pipeline drives one [`ImportJob`](crate::model::ImportJob) at a time
//! per instance: unit-level failures are logged onto the job and skipped,
//! cancellation is cooperative between units, and only fatal store errors
//! abort the run.

pub mod parsers;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument, warn};

use crate::analysis::blocks::MIN_USEFUL_CHARS;
use crate::discovery::MetadataDiscovery;
use crate::embedding::EmbeddingBackend;
use crate::errors::{ArchiveError, Result};
use crate::indexer::{ArchiveIndexer, IndexerOptions};
use crate::model::{
    ContentItem, Conversation, ImportJob, JobStatus, Message, new_id, now_millis,
};
use crate::progress::ProgressSender;
use crate::store::ArchiveStore;

/// A parser's claim on a path.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub source_type: String,
    /// In `[0, 1]`; the registry picks the highest claim.
    pub confidence: f32,
}

/// One parsed unit of importable content.
#[derive(Clone, Debug)]
pub enum ImportUnit {
    Conversation {
        conversation: Conversation,
        messages: Vec<Message>,
    },
    Item(ContentItem),
}

/// A registered format parser.
#[async_trait]
pub trait FormatParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspects `path` and returns a claim when the format looks familiar.
    async fn detect(&self, path: &Path) -> Option<Detection>;

    /// Parses the source into units. Unit-level problems should be skipped
    /// internally; a returned error fails the whole job.
    async fn parse(&self, path: &Path) -> Result<Vec<ImportUnit>>;
}

#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    /// Persist only; skip the vectorization hand-off.
    pub skip_embeddings: bool,
    pub indexer: IndexerOptions,
}

/// The import pipeline handle. One active job per instance.
pub struct ImportPipeline {
    store: ArchiveStore,
    parsers: Vec<Arc<dyn FormatParser>>,
    indexer: Option<Arc<ArchiveIndexer>>,
    backend: Option<Arc<dyn EmbeddingBackend>>,
    discovery: Option<Arc<MetadataDiscovery>>,
    active: Mutex<Option<String>>,
    cancel: Arc<AtomicBool>,
}

impl ImportPipeline {
    pub fn new(store: ArchiveStore) -> Self {
        Self {
            store,
            parsers: Vec::new(),
            indexer: None,
            backend: None,
            discovery: None,
            active: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers the built-in parser set in priority order.
    #[must_use]
    pub fn with_default_parsers(self) -> Self {
        self.with_parser(Arc::new(parsers::OpenAiArchiveParser))
            .with_parser(Arc::new(parsers::ClaudeExportParser))
            .with_parser(Arc::new(parsers::FacebookExportParser))
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn FormatParser>) -> Self {
        self.parsers.push(parser);
        self
    }

    /// Route persisted conversations to this indexer for vectorization.
    #[must_use]
    pub fn with_indexer(mut self, indexer: Arc<ArchiveIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Backend used to embed content items directly.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn EmbeddingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Discovery cache to invalidate when a job completes.
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<MetadataDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Picks the parser with the highest detection confidence; ties go to
    /// the earliest registration.
    pub async fn detect(&self, path: &Path) -> Option<(Arc<dyn FormatParser>, Detection)> {
        let mut best: Option<(Arc<dyn FormatParser>, Detection)> = None;
        for parser in &self.parsers {
            if let Some(detection) = parser.detect(path).await {
                let better = match &best {
                    Some((_, current)) => detection.confidence > current.confidence,
                    None => true,
                };
                if better {
                    best = Some((Arc::clone(parser), detection));
                }
            }
        }
        best
    }

    /// Runs one import job end to end, emitting job snapshots as progress.
    #[instrument(skip(self, sink), fields(path = %path.as_ref().display()))]
    pub async fn run_import(
        &self,
        path: impl AsRef<Path>,
        options: ImportOptions,
        sink: ProgressSender<ImportJob>,
    ) -> Result<ImportJob> {
        let path = path.as_ref();
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(ArchiveError::StoreConflict(
                    "an import job is already active".into(),
                ));
            }
            *active = Some(String::new());
        }
        self.cancel.store(false, Ordering::Relaxed);

        let result = self.run_inner(path, options, &sink).await;
        *self.active.lock() = None;
        result
    }

    async fn run_inner(
        &self,
        path: &Path,
        options: ImportOptions,
        sink: &ProgressSender<ImportJob>,
    ) -> Result<ImportJob> {
        let Some((parser, detection)) = self.detect(path).await else {
            return Err(ArchiveError::invalid(format!(
                "no registered parser recognizes {}",
                path.display()
            )));
        };
        info!(parser = parser.name(), confidence = detection.confidence, "format detected");

        let mut job = ImportJob {
            id: new_id(),
            status: JobStatus::Pending,
            source_type: detection.source_type.clone(),
            source_path: path.display().to_string(),
            source_name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("import")
                .to_string(),
            progress: 0.0,
            current_phase: String::new(),
            current_item: String::new(),
            counters: Default::default(),
            error_log: Vec::new(),
            created_at_ms: now_millis(),
            started_at_ms: None,
            completed_at_ms: None,
        };
        self.store.insert_import_job(&job).await?;
        *self.active.lock() = Some(job.id.clone());

        job.status = JobStatus::Processing;
        job.started_at_ms = Some(now_millis());
        job.current_phase = "parsing".into();
        self.store.update_import_job(&job).await?;
        sink.emit(job.clone());

        let units = match parser.parse(path).await {
            Ok(units) => units,
            Err(err) => {
                job.status = JobStatus::Failed;
                job.error_log.push(format!("parse failed: {err}"));
                job.counters.errors_count += 1;
                job.completed_at_ms = Some(now_millis());
                self.store.update_import_job(&job).await?;
                sink.emit(job.clone());
                return Err(err);
            }
        };

        job.counters.units_total = units.len() as i64;
        job.counters.media_total = units
            .iter()
            .filter(|unit| matches!(unit, ImportUnit::Item(item) if !item.media_refs.is_empty()))
            .count() as i64;
        job.current_phase = "persisting".into();
        self.store.update_import_job(&job).await?;
        sink.emit(job.clone());

        let mut conversation_ids: Vec<String> = Vec::new();
        let mut item_ids: Vec<String> = Vec::new();
        for unit in units {
            if self.cancel.load(Ordering::Relaxed) {
                job.status = JobStatus::Cancelled;
                job.completed_at_ms = Some(now_millis());
                self.store.update_import_job(&job).await?;
                sink.emit(job.clone());
                return Ok(job);
            }

            let outcome = match &unit {
                ImportUnit::Conversation {
                    conversation,
                    messages,
                } => {
                    job.current_item = conversation.title.clone();
                    let result = self.store.insert_conversation(conversation).await;
                    match result {
                        Ok(()) => {
                            match self.store.insert_messages_batch(messages.clone()).await {
                                Ok(()) => {
                                    conversation_ids.push(conversation.id.clone());
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            }
                        }
                        Err(err) => Err(err),
                    }
                }
                ImportUnit::Item(item) => {
                    job.current_item = item.title.clone().unwrap_or_else(|| item.id.clone());
                    if !item.media_refs.is_empty() {
                        job.counters.media_processed += 1;
                    }
                    match self.store.insert_content_item(item).await {
                        Ok(()) => {
                            item_ids.push(item.id.clone());
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            };

            match outcome {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    job.status = JobStatus::Failed;
                    job.error_log.push(err.to_string());
                    job.counters.errors_count += 1;
                    job.completed_at_ms = Some(now_millis());
                    self.store.update_import_job(&job).await?;
                    sink.emit(job.clone());
                    return Err(err);
                }
                Err(err) => {
                    warn!(error = %err, "unit skipped");
                    job.error_log.push(err.to_string());
                    job.counters.errors_count += 1;
                }
            }

            job.counters.units_processed += 1;
            job.progress = if job.counters.units_total > 0 {
                // Hold back the last tenth for vectorization.
                0.9 * job.counters.units_processed as f64 / job.counters.units_total as f64
            } else {
                0.9
            };
            self.store.update_import_job(&job).await?;
            sink.emit(job.clone());
        }

        if !options.skip_embeddings {
            job.current_phase = "vectorizing".into();
            self.store.update_import_job(&job).await?;
            sink.emit(job.clone());

            if let (Some(indexer), false) = (&self.indexer, conversation_ids.is_empty()) {
                if let Err(err) = indexer
                    .index_conversations(
                        &conversation_ids,
                        options.indexer.clone(),
                        ProgressSender::disabled(),
                    )
                    .await
                {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    job.error_log.push(format!("vectorization: {err}"));
                    job.counters.errors_count += 1;
                }
            }
            if let Err(err) = self.embed_items(&item_ids).await {
                if err.is_fatal() {
                    return Err(err);
                }
                job.error_log.push(format!("item embedding: {err}"));
                job.counters.errors_count += 1;
            }
        }

        job.status = JobStatus::Completed;
        job.progress = 1.0;
        job.current_phase = "complete".into();
        job.current_item = String::new();
        job.completed_at_ms = Some(now_millis());
        self.store.update_import_job(&job).await?;
        sink.emit(job.clone());

        if let Some(discovery) = &self.discovery {
            discovery.invalidate();
        }
        info!(job = job.id, units = job.counters.units_processed, "import complete");
        Ok(job)
    }

    /// Embeds freshly imported content items in one batch per call.
    async fn embed_items(&self, item_ids: &[String]) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let mut pending: Vec<(String, String)> = Vec::new();
        for id in item_ids {
            let Some(item) = self.store.get_content_item(id).await? else {
                continue;
            };
            let Some(text) = item.text else { continue };
            if text.trim().len() < MIN_USEFUL_CHARS {
                continue;
            }
            pending.push((item.id, text));
        }
        if pending.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = pending.iter().map(|(_, t)| t.clone()).collect();
        let vectors = backend.embed_batch(&texts).await?;
        let rows: Vec<(String, Vec<f32>)> = pending
            .into_iter()
            .zip(vectors)
            .map(|((id, _), mut vector)| {
                crate::embedding::l2_normalize(&mut vector);
                (id, vector)
            })
            .collect();
        self.store.insert_content_item_embeddings_batch(rows).await?;
        Ok(())
    }
}
