//! Archive traversal: conversation folders, tree linearization, and the
//! cached conversation index.
//!
//! An archive root holds one folder per conversation
//! (`YYYY-MM-DD-slug/conversation.json`) with optional siblings:
//! `conversation.html` (carrying an asset-pointer map), a
//! `media_manifest.json`, and a `media/` folder. The walker parses the
//! platform-native mapping (`nodeId → {parent, children, message}`), finds
//! the root node, and linearizes the tree breadth-first.
//!
//! Partial or malformed conversations are skipped with a warning; one bad
//! folder never aborts a full walk.

use futures_util::Stream;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::errors::{ArchiveError, Result};
use crate::model::{Conversation, Message, Role, now_seconds};

/// File name of the cached lightweight index at the archive root.
pub const INDEX_FILE_NAME: &str = "_conversation_index.json";

static FOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}-").expect("folder pattern"));

static ASSET_POINTER_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)assetPointerMap\s*=\s*\{(.*?)\}").expect("asset pointer block regex")
});

static ASSET_POINTER_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([a-z-]+://[^"]+)"\s*:\s*"([^"]+)""#).expect("asset pointer pair regex")
});

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "heic"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv"];

// ── Raw export shapes ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConversation {
    id: Option<String>,
    conversation_id: Option<String>,
    title: Option<String>,
    create_time: Option<f64>,
    update_time: Option<f64>,
    mapping: HashMap<String, RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    parent: Option<String>,
    #[serde(default)]
    children: Vec<String>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    author: Option<RawAuthor>,
    content: Option<RawContent>,
    create_time: Option<f64>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    #[serde(default)]
    parts: Option<Vec<serde_json::Value>>,
    text: Option<String>,
}

impl RawContent {
    fn flatten(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        let Some(parts) = &self.parts else {
            return String::new();
        };
        parts
            .iter()
            .filter_map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Index cache entries ────────────────────────────────────────────────

/// One entry of the cached conversation index, keyed by folder name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIndexEntry {
    pub id: String,
    pub title: String,
    pub folder: String,
    pub message_count: i64,
    pub text_length: i64,
    pub has_media: bool,
    pub has_images: bool,
    pub has_audio: bool,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
    /// Unix seconds; entries older than `mtime(conversation.json)` are
    /// refreshed on the next rebuild.
    pub indexed_at: i64,
}

/// Walks one archive root.
#[derive(Clone, Debug)]
pub struct ConversationWalker {
    root: PathBuf,
}

impl ConversationWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Conversation folders under the root, sorted by name (and therefore
    /// by date prefix).
    pub async fn discover_folders(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(ArchiveError::not_found(format!(
                "archive root {}",
                self.root.display()
            )));
        }
        let mut folders = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if FOLDER_PATTERN.is_match(name) && path.join("conversation.json").exists() {
                folders.push(path);
            }
        }
        folders.sort();
        Ok(folders)
    }

    /// Streams `(conversation, messages)` pairs, skipping bad folders.
    pub async fn walk(
        &self,
    ) -> Result<impl Stream<Item = (Conversation, Vec<Message>)> + use<>> {
        let folders = self.discover_folders().await?;
        debug!(folders = folders.len(), "walking archive");
        let stream = futures_util::stream::unfold(folders.into_iter(), |mut iter| async move {
            loop {
                let folder = iter.next()?;
                match load_conversation_folder(&folder).await {
                    Ok(pair) => return Some((pair, iter)),
                    Err(err) => {
                        warn!(folder = %folder.display(), error = %err, "skipping conversation");
                        continue;
                    }
                }
            }
        });
        Ok(stream)
    }

    /// Rebuilds the cached index incrementally: only entries older than the
    /// mtime of their `conversation.json` are re-parsed.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn refresh_index(&self) -> Result<Vec<ConversationIndexEntry>> {
        let index_path = self.root.join(INDEX_FILE_NAME);
        let mut existing: FxHashMap<String, ConversationIndexEntry> = if index_path.exists() {
            let raw = fs::read_to_string(&index_path).await?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            FxHashMap::default()
        };

        let mut fresh: FxHashMap<String, ConversationIndexEntry> = FxHashMap::default();
        for folder in self.discover_folders().await? {
            let folder_name = folder
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let mtime = file_mtime_seconds(&folder.join("conversation.json")).await;

            if let Some(entry) = existing.remove(&folder_name) {
                if entry.indexed_at >= mtime {
                    fresh.insert(folder_name, entry);
                    continue;
                }
            }

            match build_index_entry(&folder, &folder_name).await {
                Ok(entry) => {
                    fresh.insert(folder_name, entry);
                }
                Err(err) => {
                    warn!(folder = %folder.display(), error = %err, "skipping index entry");
                }
            }
        }

        let serialized = serde_json::to_string_pretty(&fresh)
            .map_err(|err| ArchiveError::invalid(format!("index serialize failed: {err}")))?;
        let tmp = index_path.with_extension("json.tmp");
        fs::write(&tmp, serialized).await?;
        fs::rename(&tmp, &index_path).await?;

        let mut entries: Vec<ConversationIndexEntry> = fresh.into_values().collect();
        entries.sort_by(|a, b| a.folder.cmp(&b.folder));
        Ok(entries)
    }
}

/// Loads and linearizes one conversation folder.
pub async fn load_conversation_folder(folder: &Path) -> Result<(Conversation, Vec<Message>)> {
    let raw = fs::read_to_string(folder.join("conversation.json")).await?;
    let parsed: RawConversation = serde_json::from_str(&raw)?;
    let folder_name = folder
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let conversation_id = parsed
        .id
        .clone()
        .or(parsed.conversation_id.clone())
        .unwrap_or_else(|| folder_name.clone());

    // Root: the unique node without a parent.
    let root_id = {
        let mut roots: Vec<&String> = parsed
            .mapping
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| id)
            .collect();
        roots.sort();
        roots
            .first()
            .cloned()
            .ok_or_else(|| ArchiveError::invalid("conversation mapping has no root node"))?
            .clone()
    };

    let mut messages = Vec::new();
    let mut gizmo_id: Option<String> = None;
    let mut model_slug: Option<String> = None;

    let mut queue = VecDeque::from([root_id]);
    let mut visited: FxHashSet<String> = FxHashSet::default();
    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id.clone()) {
            continue;
        }
        let Some(node) = parsed.mapping.get(&node_id) else {
            continue;
        };
        for child in &node.children {
            queue.push_back(child.clone());
        }

        let (role, content, created_at) = match &node.message {
            Some(message) => {
                if let Some(meta) = &message.metadata {
                    if gizmo_id.is_none() {
                        gizmo_id = meta
                            .get("gizmo_id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                    }
                    if model_slug.is_none() {
                        model_slug = meta
                            .get("model_slug")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                    }
                }
                (
                    message
                        .author
                        .as_ref()
                        .and_then(|a| a.role.as_deref())
                        .map(Role::parse)
                        .unwrap_or(Role::System),
                    message
                        .content
                        .as_ref()
                        .map(RawContent::flatten)
                        .unwrap_or_default(),
                    message.create_time.map(|t| t as i64).unwrap_or(0),
                )
            }
            None => (Role::System, String::new(), 0),
        };

        messages.push(Message {
            id: node_id,
            conversation_id: conversation_id.clone(),
            role,
            content,
            parent_id: node.parent.clone(),
            created_at,
            embedding_id: None,
        });
    }

    let mut metadata = serde_json::Map::new();
    if let Some(gizmo) = &gizmo_id {
        metadata.insert("gizmoId".into(), serde_json::Value::String(gizmo.clone()));
    }
    if let Some(slug) = &model_slug {
        metadata.insert("modelSlug".into(), serde_json::Value::String(slug.clone()));
    }

    let created_at = parsed.create_time.map(|t| t as i64).unwrap_or(0);
    let conversation = Conversation {
        id: conversation_id,
        title: parsed.title.unwrap_or_else(|| folder_name.clone()),
        source: "openai".to_string(),
        folder: folder_name,
        created_at,
        updated_at: parsed.update_time.map(|t| t as i64).unwrap_or(created_at),
        message_count: messages.len() as i64,
        is_interesting: false,
        summary: None,
        summary_embedding_id: None,
        metadata: serde_json::Value::Object(metadata),
    };

    Ok((conversation, messages))
}

/// Extracts the `assetPointerMap` from a sibling `conversation.html`,
/// mapping asset pointers (`file-service://…`) to display file names.
pub fn extract_asset_pointer_map(html: &str) -> FxHashMap<String, String> {
    let mut map = FxHashMap::default();
    if let Some(block) = ASSET_POINTER_BLOCK.captures(html).and_then(|c| c.get(1)) {
        for pair in ASSET_POINTER_PAIR.captures_iter(block.as_str()) {
            map.insert(pair[1].to_string(), pair[2].to_string());
        }
    }
    map
}

/// Loads the sibling `media_manifest.json` (display name → real file name).
pub async fn load_media_manifest(folder: &Path) -> FxHashMap<String, String> {
    let path = folder.join("media_manifest.json");
    let Ok(raw) = fs::read_to_string(&path).await else {
        return FxHashMap::default();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

async fn file_mtime_seconds(path: &Path) -> i64 {
    match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(time) => time
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        Err(_) => 0,
    }
}

async fn build_index_entry(folder: &Path, folder_name: &str) -> Result<ConversationIndexEntry> {
    let (conversation, messages) = load_conversation_folder(folder).await?;
    let text_length: i64 = messages.iter().map(|m| m.content.len() as i64).sum();

    let (has_images, has_audio, has_video) = scan_media(folder).await;
    Ok(ConversationIndexEntry {
        id: conversation.id,
        title: conversation.title,
        folder: folder_name.to_string(),
        message_count: messages.len() as i64,
        text_length,
        has_media: has_images || has_audio || has_video,
        has_images,
        has_audio,
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
        indexed_at: now_seconds(),
    })
}

/// Looks for media files in `media/`, falling back to the conversation
/// folder itself.
async fn scan_media(folder: &Path) -> (bool, bool, bool) {
    let media_dir = folder.join("media");
    let scan_dir = if media_dir.is_dir() { media_dir } else { folder.to_path_buf() };

    let (mut images, mut audio, mut video) = (false, false, false);
    let Ok(mut dir) = fs::read_dir(&scan_dir).await else {
        return (false, false, false);
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        images |= IMAGE_EXTENSIONS.contains(&ext.as_str());
        audio |= AUDIO_EXTENSIONS.contains(&ext.as_str());
        video |= VIDEO_EXTENSIONS.contains(&ext.as_str());
    }
    (images, audio, video)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::tempdir;

    async fn write_conversation(root: &Path, folder: &str, json: &str) -> PathBuf {
        let dir = root.join(folder);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("conversation.json"), json)
            .await
            .unwrap();
        dir
    }

    fn simple_tree() -> String {
        serde_json::json!({
            "id": "conv-1",
            "title": "Hello",
            "create_time": 1704067200.5,
            "update_time": 1704070800.0,
            "mapping": {
                "root": {"parent": null, "children": ["m1"], "message": null},
                "m1": {"parent": "root", "children": ["m2"], "message": {
                    "author": {"role": "user"},
                    "content": {"parts": ["Hi"]},
                    "create_time": 1704067201.0
                }},
                "m2": {"parent": "m1", "children": [], "message": {
                    "author": {"role": "assistant"},
                    "content": {"parts": ["Hello there."]},
                    "create_time": 1704067202.0,
                    "metadata": {"model_slug": "gpt-4o", "gizmo_id": "g-xyz"}
                }}
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn walks_in_bfs_order() {
        let dir = tempdir().unwrap();
        write_conversation(dir.path(), "2024-01-01-hello", &simple_tree()).await;

        let walker = ConversationWalker::new(dir.path());
        let pairs: Vec<_> = walker.walk().await.unwrap().collect().await;
        assert_eq!(pairs.len(), 1);

        let (conversation, messages) = &pairs[0];
        assert_eq!(conversation.id, "conv-1");
        assert_eq!(conversation.created_at, 1704067200);
        assert_eq!(conversation.metadata["gizmoId"], "g-xyz");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id, "root");
        assert_eq!(messages[1].content, "Hi");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].parent_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn malformed_conversations_are_skipped() {
        let dir = tempdir().unwrap();
        write_conversation(dir.path(), "2024-01-01-good", &simple_tree()).await;
        write_conversation(dir.path(), "2024-01-02-bad", "{not json").await;
        // No date prefix: not a conversation folder at all.
        write_conversation(dir.path(), "notes", &simple_tree()).await;

        let walker = ConversationWalker::new(dir.path());
        let pairs: Vec<_> = walker.walk().await.unwrap().collect().await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.folder, "2024-01-01-good");
    }

    #[tokio::test]
    async fn empty_archive_walks_zero_conversations() {
        let dir = tempdir().unwrap();
        let walker = ConversationWalker::new(dir.path());
        let pairs: Vec<_> = walker.walk().await.unwrap().collect().await;
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn index_refresh_is_incremental() {
        let dir = tempdir().unwrap();
        write_conversation(dir.path(), "2024-01-01-hello", &simple_tree()).await;

        let walker = ConversationWalker::new(dir.path());
        let first = walker.refresh_index().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_count, 3);
        assert!(first[0].text_length > 0);

        // Second pass reuses the cached entry (same indexed_at).
        let second = walker.refresh_index().await.unwrap();
        assert_eq!(first[0].indexed_at, second[0].indexed_at);

        // A rewritten conversation with a future mtime gets refreshed.
        let conv = dir.path().join("2024-01-01-hello/conversation.json");
        tokio::fs::write(&conv, simple_tree()).await.unwrap();
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(120);
        let file = std::fs::OpenOptions::new().write(true).open(&conv).unwrap();
        file.set_modified(future).unwrap();

        let third = walker.refresh_index().await.unwrap();
        assert_eq!(third.len(), 1);
        assert!(third[0].indexed_at >= second[0].indexed_at);
    }

    #[test]
    fn asset_pointer_map_extraction() {
        let html = r#"<script>var assetPointerMap = {"file-service://file-abc": "photo.png", "file-service://file-def": "chart.webp"}; </script>"#;
        let map = extract_asset_pointer_map(html);
        assert_eq!(map.len(), 2);
        assert_eq!(map["file-service://file-abc"], "photo.png");
    }
}
