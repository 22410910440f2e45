//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use palimpsest::config::ServiceConfig;
use palimpsest::embedding::{EmbeddingBackend, MockEmbeddingBackend, l2_normalize};
use palimpsest::model::{Conversation, Message, Role, new_id};
use palimpsest::store::ArchiveStore;

pub const DIMS: usize = 32;

/// A service config shrunk to the test embedding dimension.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.embeddings.dimensions = DIMS;
    config
}

pub fn mock_backend() -> Arc<MockEmbeddingBackend> {
    Arc::new(MockEmbeddingBackend::with_dimensions(DIMS))
}

pub async fn open_store(dir: &Path) -> ArchiveStore {
    ArchiveStore::open(dir.join("test.db"), DIMS)
        .await
        .expect("store opens")
}

/// The deterministic vector the mock backend would produce for `text`.
pub async fn vector_for(backend: &MockEmbeddingBackend, text: &str) -> Vec<f32> {
    backend.embed(text).await.expect("mock embed")
}

/// A unit vector leaning toward one axis, for hand-crafted similarities.
pub fn axis_vector(axis: usize, lean: f32) -> Vec<f32> {
    let mut vector = vec![0.05f32; DIMS];
    vector[axis % DIMS] = lean;
    l2_normalize(&mut vector);
    vector
}

pub fn conversation(id: &str, title: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        title: title.to_string(),
        source: "openai".to_string(),
        folder: format!("2024-01-01-{id}"),
        created_at: 1_704_067_200,
        updated_at: 1_704_070_800,
        message_count: 0,
        is_interesting: false,
        summary: None,
        summary_embedding_id: None,
        metadata: serde_json::json!({}),
    }
}

pub fn message(id: &str, conversation_id: &str, role: Role, content: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        role,
        content: content.to_string(),
        parent_id: None,
        created_at: 1_704_067_201,
        embedding_id: None,
    }
}

/// Seeds one conversation with the given `(id, role, content)` messages.
pub async fn seed_conversation(
    store: &ArchiveStore,
    conversation_id: &str,
    title: &str,
    messages: &[(&str, Role, &str)],
) {
    let mut conv = conversation(conversation_id, title);
    conv.message_count = messages.len() as i64;
    store.insert_conversation(&conv).await.expect("conversation");
    let rows: Vec<Message> = messages
        .iter()
        .map(|(id, role, content)| message(id, conversation_id, *role, content))
        .collect();
    store.insert_messages_batch(rows).await.expect("messages");
}

/// Writes an OpenAI-style conversation folder under `root`.
pub async fn write_archive_conversation(
    root: &Path,
    folder: &str,
    conversation_id: &str,
    turns: &[(&str, &str)],
) -> PathBuf {
    let mut mapping = serde_json::Map::new();
    mapping.insert(
        "root".into(),
        serde_json::json!({
            "parent": null,
            "children": [turns.first().map(|_| "m0").unwrap_or("m0")],
            "message": null
        }),
    );
    for (index, (role, content)) in turns.iter().enumerate() {
        let id = format!("m{index}");
        let child = format!("m{}", index + 1);
        let children: Vec<String> = if index + 1 < turns.len() {
            vec![child]
        } else {
            Vec::new()
        };
        let parent = if index == 0 {
            "root".to_string()
        } else {
            format!("m{}", index - 1)
        };
        mapping.insert(
            id,
            serde_json::json!({
                "parent": parent,
                "children": children,
                "message": {
                    "author": {"role": role},
                    "content": {"parts": [content]},
                    "create_time": 1_704_067_201.0 + index as f64
                }
            }),
        );
    }

    let payload = serde_json::json!({
        "id": conversation_id,
        "title": folder,
        "create_time": 1_704_067_200.0,
        "update_time": 1_704_070_800.0,
        "mapping": mapping
    });

    let dir = root.join(folder);
    tokio::fs::create_dir_all(&dir).await.expect("mkdir");
    tokio::fs::write(dir.join("conversation.json"), payload.to_string())
        .await
        .expect("write conversation");
    dir
}

/// A long, substantive body that sails through the junk filter and the
/// harvest quality gate.
pub fn substantive(topic: &str) -> String {
    format!(
        "I finally worked through the {topic} problem today. The key is that the \
         import batches were too large, so I measured the timings, found the 95th \
         percentile at 1200 ms, and decided to plan a fix: cap each batch at 32 \
         rows and check the queue depth before every write. After that change the \
         Austin Dataset import finished in 3 minutes instead of 40, which honestly \
         made me happy because it unblocks the rest of the migration work."
    )
}

#[allow(dead_code)]
pub fn unique_id() -> String {
    new_id()
}
