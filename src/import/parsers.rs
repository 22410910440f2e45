//! Built-in format parsers.
//!
//! Each parser recognizes one export shape: OpenAI archive folders (the
//! walker's native layout), Claude `conversations.json` exports, and
//! Facebook post exports. Detection is cheap (path shape plus a content
//! sniff); parsing skips malformed entries instead of failing the job.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::errors::{ArchiveError, Result};
use crate::model::{ContentItem, Conversation, Message, Role};
use crate::walker::ConversationWalker;

use super::{Detection, FormatParser, ImportUnit};

// ── OpenAI archive folders ─────────────────────────────────────────────

/// An archive root full of `YYYY-MM-DD-slug/conversation.json` folders.
pub struct OpenAiArchiveParser;

#[async_trait]
impl FormatParser for OpenAiArchiveParser {
    fn name(&self) -> &'static str {
        "openai_archive"
    }

    async fn detect(&self, path: &Path) -> Option<Detection> {
        if !path.is_dir() {
            return None;
        }
        let walker = ConversationWalker::new(path);
        match walker.discover_folders().await {
            Ok(folders) if !folders.is_empty() => Some(Detection {
                source_type: "openai_archive".into(),
                confidence: 0.9,
            }),
            _ => None,
        }
    }

    async fn parse(&self, path: &Path) -> Result<Vec<ImportUnit>> {
        let walker = ConversationWalker::new(path);
        let stream = walker.walk().await?;
        let units = stream
            .map(|(conversation, messages)| ImportUnit::Conversation {
                conversation,
                messages,
            })
            .collect()
            .await;
        Ok(units)
    }
}

// ── Claude conversations.json ──────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct RawClaudeConversation {
    uuid: String,
    name: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    #[serde(default)]
    chat_messages: Vec<RawClaudeMessage>,
}

#[derive(Debug, serde::Deserialize)]
struct RawClaudeMessage {
    uuid: String,
    sender: Option<String>,
    text: Option<String>,
    created_at: Option<String>,
}

fn iso_to_seconds(raw: Option<&str>) -> i64 {
    raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

/// A Claude data export: one JSON array of conversations with
/// `chat_messages`.
pub struct ClaudeExportParser;

#[async_trait]
impl FormatParser for ClaudeExportParser {
    fn name(&self) -> &'static str {
        "claude_export"
    }

    async fn detect(&self, path: &Path) -> Option<Detection> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        let raw = fs::read_to_string(path).await.ok()?;
        if raw.trim_start().starts_with('[') && raw.contains("\"chat_messages\"") {
            Some(Detection {
                source_type: "claude_export".into(),
                confidence: 0.85,
            })
        } else {
            None
        }
    }

    async fn parse(&self, path: &Path) -> Result<Vec<ImportUnit>> {
        let raw = fs::read_to_string(path).await?;
        let conversations: Vec<serde_json::Value> = serde_json::from_str(&raw)?;

        let mut units = Vec::new();
        for value in conversations {
            let parsed: RawClaudeConversation = match serde_json::from_value(value) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "skipping malformed claude conversation");
                    continue;
                }
            };

            let created_at = iso_to_seconds(parsed.created_at.as_deref());
            let mut messages = Vec::with_capacity(parsed.chat_messages.len());
            let mut previous: Option<String> = None;
            for raw_message in &parsed.chat_messages {
                let role = match raw_message.sender.as_deref() {
                    Some("human") => Role::User,
                    Some("assistant") => Role::Assistant,
                    other => Role::parse(other.unwrap_or("user")),
                };
                messages.push(Message {
                    id: raw_message.uuid.clone(),
                    conversation_id: parsed.uuid.clone(),
                    role,
                    content: raw_message.text.clone().unwrap_or_default(),
                    parent_id: previous.clone(),
                    created_at: iso_to_seconds(raw_message.created_at.as_deref()),
                    embedding_id: None,
                });
                previous = Some(raw_message.uuid.clone());
            }

            let conversation = Conversation {
                id: parsed.uuid.clone(),
                title: parsed.name.clone().unwrap_or_else(|| "Untitled".into()),
                source: "claude".into(),
                folder: String::new(),
                created_at,
                updated_at: iso_to_seconds(parsed.updated_at.as_deref()).max(created_at),
                message_count: messages.len() as i64,
                is_interesting: false,
                summary: None,
                summary_embedding_id: None,
                metadata: serde_json::json!({}),
            };
            units.push(ImportUnit::Conversation {
                conversation,
                messages,
            });
        }
        Ok(units)
    }
}

// ── Facebook posts export ──────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct RawFacebookPost {
    timestamp: Option<i64>,
    title: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    attachments: Vec<serde_json::Value>,
}

/// A Facebook `posts.json`-style export.
pub struct FacebookExportParser;

impl FacebookExportParser {
    fn post_text(post: &RawFacebookPost) -> Option<String> {
        let text: Vec<&str> = post
            .data
            .iter()
            .filter_map(|entry| entry.get("post").and_then(|v| v.as_str()))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n\n"))
        }
    }

    fn media_refs(post: &RawFacebookPost) -> Vec<String> {
        let mut refs = Vec::new();
        for attachment in &post.attachments {
            let Some(data) = attachment.get("data").and_then(|v| v.as_array()) else {
                continue;
            };
            for entry in data {
                if let Some(uri) = entry
                    .get("media")
                    .and_then(|m| m.get("uri"))
                    .and_then(|v| v.as_str())
                {
                    refs.push(uri.to_string());
                }
            }
        }
        refs
    }
}

#[async_trait]
impl FormatParser for FacebookExportParser {
    fn name(&self) -> &'static str {
        "facebook_export"
    }

    async fn detect(&self, path: &Path) -> Option<Detection> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        let raw = fs::read_to_string(path).await.ok()?;
        if raw.contains("\"timestamp\"") && raw.contains("\"data\"") {
            Some(Detection {
                source_type: "facebook_export".into(),
                confidence: 0.6,
            })
        } else {
            None
        }
    }

    async fn parse(&self, path: &Path) -> Result<Vec<ImportUnit>> {
        let raw = fs::read_to_string(path).await?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        // Either a bare array of posts or an export object wrapping one.
        let posts = match &value {
            serde_json::Value::Array(items) => items.clone(),
            serde_json::Value::Object(map) => map
                .values()
                .find_map(|v| v.as_array().cloned())
                .ok_or_else(|| ArchiveError::invalid("facebook export holds no post array"))?,
            _ => return Err(ArchiveError::invalid("unrecognized facebook export shape")),
        };

        let mut units = Vec::new();
        for (position, value) in posts.into_iter().enumerate() {
            let post: RawFacebookPost = match serde_json::from_value(value) {
                Ok(post) => post,
                Err(err) => {
                    warn!(error = %err, "skipping malformed facebook post");
                    continue;
                }
            };
            let timestamp = post.timestamp.unwrap_or(0);
            // Stable id across re-imports: position-salted timestamp key.
            let id = format!("fb-post-{timestamp}-{position}");
            let uri = format!("content://facebook/post/{id}");
            units.push(ImportUnit::Item(ContentItem {
                id,
                item_type: "post".into(),
                source: "facebook".into(),
                text: Self::post_text(&post),
                title: post.title.clone(),
                created_at: timestamp,
                author_name: None,
                is_own_content: true,
                thread_id: None,
                parent_id: None,
                media_refs: Self::media_refs(&post),
                metadata: serde_json::json!({}),
                uri: Some(uri),
            }));
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn claude_export_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        let payload = serde_json::json!([{
            "uuid": "c-1",
            "name": "Trip planning",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T11:00:00Z",
            "chat_messages": [
                {"uuid": "m-1", "sender": "human", "text": "Where should we go hiking?",
                 "created_at": "2024-03-01T10:00:01Z"},
                {"uuid": "m-2", "sender": "assistant", "text": "The coastal trail is lovely in spring.",
                 "created_at": "2024-03-01T10:00:05Z"}
            ]
        }]);
        tokio::fs::write(&path, payload.to_string()).await.unwrap();

        let parser = ClaudeExportParser;
        let detection = parser.detect(&path).await.unwrap();
        assert_eq!(detection.source_type, "claude_export");

        let units = parser.parse(&path).await.unwrap();
        assert_eq!(units.len(), 1);
        let ImportUnit::Conversation {
            conversation,
            messages,
        } = &units[0]
        else {
            panic!("expected a conversation unit");
        };
        assert_eq!(conversation.source, "claude");
        assert_eq!(conversation.created_at, 1709287200);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].parent_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn facebook_posts_become_content_items() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("posts.json");
        let payload = serde_json::json!([{
            "timestamp": 1600000000,
            "title": "A day at the lake",
            "data": [{"post": "We finally made it out to the lake this weekend."}],
            "attachments": [{"data": [{"media": {"uri": "photos/lake.jpg"}}]}]
        }]);
        tokio::fs::write(&path, payload.to_string()).await.unwrap();

        let parser = FacebookExportParser;
        assert!(parser.detect(&path).await.is_some());

        let units = parser.parse(&path).await.unwrap();
        assert_eq!(units.len(), 1);
        let ImportUnit::Item(item) = &units[0] else {
            panic!("expected an item unit");
        };
        assert_eq!(item.source, "facebook");
        assert_eq!(item.created_at, 1600000000);
        assert_eq!(item.media_refs, vec!["photos/lake.jpg".to_string()]);
        assert_eq!(item.uri.as_deref(), Some("content://facebook/post/fb-post-1600000000-0"));
        // Re-parsing yields the same stable ids.
        let again = parser.parse(&path).await.unwrap();
        let ImportUnit::Item(item_again) = &again[0] else {
            panic!("expected an item unit");
        };
        assert_eq!(item.id, item_again.id);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        let payload = serde_json::json!([
            {"uuid": "ok-1", "name": "Fine", "chat_messages": []},
            {"unexpected": "shape", "chat_messages": "not-an-array"}
        ]);
        tokio::fs::write(&path, payload.to_string()).await.unwrap();

        let units = ClaudeExportParser.parse(&path).await.unwrap();
        assert_eq!(units.len(), 1);
    }
}
