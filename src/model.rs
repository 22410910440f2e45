//! Core domain entities shared by the store, indexer, and query layers.
//!
//! All identifiers are UUID-shaped strings unless a stable derived key is
//! called out (conversation folders keep their on-disk folder name as part
//! of their identity so re-imports stay idempotent).
//!
//! Timestamp convention: content-derived rows (`Conversation`, `Message`,
//! `ContentItem`) carry Unix **seconds**; import-job lifecycle fields carry
//! Unix **milliseconds** and are suffixed `_ms` in the schema.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ArchiveError;

/// Author role of a message within a conversation tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    /// Parses a stored or platform-native role string. Unknown roles fold
    /// into `Tool` so foreign exports cannot abort an import.
    pub fn parse(s: &str) -> Role {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::Tool,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared content type of a retrieval chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Prose,
    Code,
    Math,
    Table,
    Heading,
    List,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Prose => "prose",
            ContentKind::Code => "code",
            ContentKind::Math => "math",
            ContentKind::Table => "table",
            ContentKind::Heading => "heading",
            ContentKind::List => "list",
        }
    }

    pub fn parse(s: &str) -> ContentKind {
        match s {
            "code" => ContentKind::Code,
            "math" => ContentKind::Math,
            "table" => ContentKind::Table,
            "heading" => ContentKind::Heading,
            "list" => ContentKind::List,
            _ => ContentKind::Prose,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a sub-message semantic unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Code,
    ImagePrompt,
    Artifact,
    Canvas,
    Transcription,
    JsonData,
    Prose,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Code => "code",
            BlockKind::ImagePrompt => "image_prompt",
            BlockKind::Artifact => "artifact",
            BlockKind::Canvas => "canvas",
            BlockKind::Transcription => "transcription",
            BlockKind::JsonData => "json_data",
            BlockKind::Prose => "prose",
        }
    }

    pub fn parse(s: &str) -> BlockKind {
        match s {
            "code" => BlockKind::Code,
            "image_prompt" => BlockKind::ImagePrompt,
            "artifact" => BlockKind::Artifact,
            "canvas" => BlockKind::Canvas,
            "transcription" => BlockKind::Transcription,
            "json_data" => BlockKind::JsonData,
            _ => BlockKind::Prose,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed relation between two URI-addressed pieces of content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Parent,
    Child,
    Reference,
    Transclusion,
    Similar,
    Follows,
    RespondsTo,
    VersionOf,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Parent => "parent",
            LinkType::Child => "child",
            LinkType::Reference => "reference",
            LinkType::Transclusion => "transclusion",
            LinkType::Similar => "similar",
            LinkType::Follows => "follows",
            LinkType::RespondsTo => "responds_to",
            LinkType::VersionOf => "version_of",
        }
    }

    /// Strict parse: an unknown link type is a caller error, not a default.
    pub fn parse(s: &str) -> Result<LinkType, ArchiveError> {
        match s {
            "parent" => Ok(LinkType::Parent),
            "child" => Ok(LinkType::Child),
            "reference" => Ok(LinkType::Reference),
            "transclusion" => Ok(LinkType::Transclusion),
            "similar" => Ok(LinkType::Similar),
            "follows" => Ok(LinkType::Follows),
            "responds_to" => Ok(LinkType::RespondsTo),
            "version_of" => Ok(LinkType::VersionOf),
            other => Err(ArchiveError::invalid(format!("unknown link type: {other}"))),
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an import job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> JobStatus {
        match s {
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation imported from a platform export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Export origin, e.g. `openai`, `claude`, `facebook`.
    pub source: String,
    /// On-disk folder name within the archive root.
    pub folder: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
    pub message_count: i64,
    pub is_interesting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_embedding_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One node of a conversation tree, linearized by the walker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<String>,
}

/// Unified social/notes record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    /// Open set: `post`, `comment`, `message`, `photo`, `note`, `document`, …
    pub item_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub is_own_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub media_refs: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Stable external identifier used by the link graph. Unique when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// A higher-level semantic fragment extracted from a message.
///
/// When a block was split for size, its `metadata` carries `parentBlockId`
/// and `chunkIndex`; the split siblings share everything except id, content,
/// and embedding id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    pub id: String,
    pub parent_message_id: String,
    pub parent_conversation_id: String,
    pub block_type: BlockKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
    /// Byte offset into the parent message text.
    pub start_offset: usize,
    pub end_offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gizmo_id: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<String>,
}

/// The smallest indexed retrieval unit.
///
/// `(thread_id, chunk_index)` is unique; offsets are byte offsets into the
/// source message text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    /// Conversation id of the owning thread.
    pub thread_id: String,
    /// Message the chunk was cut from; offsets index into its text.
    pub message_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub word_count: i64,
    pub token_count: i64,
    pub content_type: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub start_offset: usize,
    pub end_offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<String>,
}

/// A directed, typed link between two URI-addressed content nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: String,
    pub source_uri: String,
    pub target_uri: String,
    pub link_type: LinkType,
    /// Confidence/strength in `[0, 1]`.
    pub link_strength: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_by: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Unix seconds.
    pub created_at: i64,
}

/// Counters carried by an import job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub units_total: i64,
    pub units_processed: i64,
    pub media_total: i64,
    pub media_processed: i64,
    pub errors_count: i64,
}

/// One import run. Exactly one job is active per pipeline instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub status: JobStatus,
    pub source_type: String,
    pub source_path: String,
    pub source_name: String,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub current_phase: String,
    pub current_item: String,
    #[serde(flatten)]
    pub counters: JobCounters,
    #[serde(default)]
    pub error_log: Vec<String>,
    /// Unix milliseconds.
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
}

/// Cached description of one analyzed image file. Unique per `file_path`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysis {
    pub id: String,
    /// Absolute path on disk.
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub source: String,
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub objects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    pub model_used: String,
    pub confidence: f64,
    pub processing_time_ms: i64,
}

/// Current Unix time in seconds.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh UUIDv4 string, the default identifier scheme.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_type_round_trips() {
        for ty in [
            LinkType::Parent,
            LinkType::Child,
            LinkType::Reference,
            LinkType::Transclusion,
            LinkType::Similar,
            LinkType::Follows,
            LinkType::RespondsTo,
            LinkType::VersionOf,
        ] {
            assert_eq!(LinkType::parse(ty.as_str()).unwrap(), ty);
        }
        assert!(LinkType::parse("points_at").is_err());
    }

    #[test]
    fn unknown_roles_fold_into_tool() {
        assert_eq!(Role::parse("function"), Role::Tool);
        assert_eq!(Role::parse("assistant"), Role::Assistant);
    }

    #[test]
    fn terminal_job_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
