//! Progress records for indexing runs.

use serde::{Deserialize, Serialize};

use crate::model::now_millis;
use crate::progress::ProgressSender;

/// Phases of one indexing run, in execution order. The bracketed phases
/// only run when their option is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    Idle,
    Initializing,
    LoadingModel,
    Extracting,
    EmbeddingMessages,
    EmbeddingParagraphs,
    ExtractingContentBlocks,
    Summarizing,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Idle,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// One progress record; emitted on every phase change and batch boundary.
/// `current` is monotone within a phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexProgress {
    pub status: IndexStatus,
    pub phase: IndexPhase,
    pub current: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds.
    pub started_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
}

/// Tracks one run and forwards records to the sink.
pub(crate) struct ProgressTracker {
    sender: ProgressSender<IndexProgress>,
    started_at_ms: i64,
    phase: IndexPhase,
    current: usize,
    total: usize,
}

impl ProgressTracker {
    pub(crate) fn start(sender: ProgressSender<IndexProgress>) -> Self {
        let tracker = Self {
            sender,
            started_at_ms: now_millis(),
            phase: IndexPhase::Initializing,
            current: 0,
            total: 0,
        };
        tracker.emit(IndexStatus::Running, None, None);
        tracker
    }

    pub(crate) fn phase(&mut self, phase: IndexPhase, total: usize) {
        self.phase = phase;
        self.current = 0;
        self.total = total;
        self.emit(IndexStatus::Running, None, None);
    }

    pub(crate) fn tick(&mut self, current: usize, item: Option<String>) {
        // Monotone within a phase.
        self.current = self.current.max(current);
        self.emit(IndexStatus::Running, item, None);
    }

    pub(crate) fn done(&mut self) {
        self.phase = IndexPhase::Done;
        self.emit_completed(IndexStatus::Done, None);
    }

    pub(crate) fn failed(&mut self, error: String, cancelled: bool) {
        self.phase = IndexPhase::Failed;
        let status = if cancelled {
            IndexStatus::Cancelled
        } else {
            IndexStatus::Failed
        };
        self.emit_completed(status, Some(error));
    }

    fn emit(&self, status: IndexStatus, current_item: Option<String>, error: Option<String>) {
        self.sender.emit(IndexProgress {
            status,
            phase: self.phase,
            current: self.current,
            total: self.total,
            current_item,
            error,
            started_at_ms: self.started_at_ms,
            completed_at_ms: None,
        });
    }

    fn emit_completed(&self, status: IndexStatus, error: Option<String>) {
        self.sender.emit(IndexProgress {
            status,
            phase: self.phase,
            current: self.current,
            total: self.total,
            current_item: None,
            error,
            started_at_ms: self.started_at_ms,
            completed_at_ms: Some(now_millis()),
        });
    }
}
