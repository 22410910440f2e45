//! Per-granularity embedding rows and dense vector search.
//!
//! Each granularity keeps its own table (messages, chunks, summaries,
//! content items, content blocks, image descriptions) because their
//! pre-filter labels differ. Labels are derived from the owner row inside
//! the insert statement itself, so a vector row can never disagree with the
//! entity it annotates, and inserting a vector for a missing owner is a
//! `NotFound` instead of an orphan.
//!
//! Ranking uses `vec_distance_cosine` over the pre-filtered rows; with
//! L2-normalized vectors `similarity = 1 − distance`.

use serde::{Deserialize, Serialize};
use crate::errors::Rusqlite;
use tokio_rusqlite::OptionalExtension;

use crate::errors::{ArchiveError, Result};
use crate::model::{BlockKind, ContentKind, Role, new_id};

use super::{ArchiveStore, blob_to_vec, parse_json_column, vec_to_blob};

/// Dense hit against the message grain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHit {
    pub id: String,
    pub content: String,
    pub similarity: f32,
    pub conversation_id: String,
    pub conversation_title: String,
    pub conversation_folder: String,
    pub message_role: Role,
    pub metadata: serde_json::Value,
}

/// Dense hit against the chunk grain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    pub id: String,
    pub content: String,
    pub similarity: f32,
    pub thread_id: String,
    pub message_id: String,
    pub chunk_index: i64,
    pub content_type: ContentKind,
    pub word_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Dense hit against the content-item grain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemHit {
    pub id: String,
    pub similarity: f32,
    pub item_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub created_at: i64,
    pub metadata: serde_json::Value,
}

/// Dense hit against the content-block grain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHit {
    pub id: String,
    pub similarity: f32,
    pub block_type: BlockKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
    pub parent_message_id: String,
    pub parent_conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gizmo_id: Option<String>,
}

/// Semantic image hit via description embeddings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageHit {
    pub id: String,
    pub file_path: String,
    pub description: String,
    pub source: String,
    pub score: f32,
}

/// Lexical hit from the chunk FTS index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparseHit {
    pub chunk_id: String,
    pub score: f32,
}

fn query_param(vector: &[f32]) -> String {
    serde_json::to_string(vector).expect("f32 slice serializes")
}

/// Error type for [`ArchiveStore::insert_embedding_rows`]'s transaction
/// closure: it needs to distinguish a SQL failure from "the owner row is
/// missing" without a boxed `dyn Error`, since `tokio_rusqlite::Error` no
/// longer has a variant for arbitrary boxed errors.
enum InsertRowsError {
    Sql(tokio_rusqlite::rusqlite::Error),
    NotFound(String),
}

impl ArchiveStore {
    pub(crate) async fn insert_embedding_rows(
        &self,
        insert_sql: &'static str,
        owner_update_sql: Option<&'static str>,
        owner_kind: &'static str,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Vec<String>> {
        for (_, vector) in &rows {
            self.ensure_dimensions(vector)?;
        }
        let prepared: Vec<(String, String, Vec<u8>)> = rows
            .into_iter()
            .map(|(owner_id, vector)| (new_id(), owner_id, vec_to_blob(&vector)))
            .collect();
        let ids: Vec<String> = prepared.iter().map(|(id, _, _)| id.clone()).collect();

        self.connection()
            .call(move |conn| {
                let tx = conn.transaction().map_err(InsertRowsError::Sql)?;
                {
                    let mut insert = tx.prepare(insert_sql).map_err(InsertRowsError::Sql)?;
                    let mut update = owner_update_sql
                        .map(|sql| tx.prepare(sql))
                        .transpose()
                        .map_err(InsertRowsError::Sql)?;
                    for (id, owner_id, blob) in &prepared {
                        let inserted = insert
                            .execute((id, owner_id, blob))
                            .map_err(InsertRowsError::Sql)?;
                        if inserted == 0 {
                            return Err(InsertRowsError::NotFound(format!(
                                "{owner_kind} {owner_id} not found"
                            )));
                        }
                        if let Some(update) = update.as_mut() {
                            update
                                .execute((id, owner_id))
                                .map_err(InsertRowsError::Sql)?;
                        }
                    }
                }
                tx.commit().map_err(InsertRowsError::Sql)?;
                Ok(())
            })
            .await
            .map_err(|err| match err {
                tokio_rusqlite::Error::Error(InsertRowsError::NotFound(msg)) => {
                    ArchiveError::not_found(msg)
                }
                tokio_rusqlite::Error::Error(InsertRowsError::Sql(e)) => {
                    ArchiveError::from(tokio_rusqlite::Error::Error(e))
                }
                tokio_rusqlite::Error::ConnectionClosed => {
                    ArchiveError::from(tokio_rusqlite::Error::ConnectionClosed)
                }
                tokio_rusqlite::Error::Close((conn, e)) => {
                    ArchiveError::from(tokio_rusqlite::Error::Close((conn, e)))
                }
                _ => ArchiveError::Storage("unknown sqlite error".to_string()),
            })?;
        Ok(ids)
    }

    /// Stores one message embedding and links it to its owner row.
    pub async fn insert_message_embedding(
        &self,
        message_id: &str,
        vector: &[f32],
    ) -> Result<String> {
        let ids = self
            .insert_message_embeddings_batch(vec![(message_id.to_string(), vector.to_vec())])
            .await?;
        Ok(ids.into_iter().next().expect("one id per row"))
    }

    /// Transactional batch variant; returns embedding ids in input order.
    pub async fn insert_message_embeddings_batch(
        &self,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Vec<String>> {
        self.insert_embedding_rows(
            "INSERT INTO message_embeddings (id, owner_id, embedding, role, source, gizmo_id)
             SELECT ?1, ?2, ?3, m.role, c.source, json_extract(c.metadata, '$.gizmoId')
             FROM messages m JOIN conversations c ON c.id = m.conversation_id
             WHERE m.id = ?2",
            Some("UPDATE messages SET embedding_id = ?1 WHERE id = ?2"),
            "message",
            rows,
        )
        .await
    }

    pub async fn insert_chunk_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<String> {
        let ids = self
            .insert_chunk_embeddings_batch(vec![(chunk_id.to_string(), vector.to_vec())])
            .await?;
        Ok(ids.into_iter().next().expect("one id per row"))
    }

    pub async fn insert_chunk_embeddings_batch(
        &self,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Vec<String>> {
        self.insert_embedding_rows(
            "INSERT INTO chunk_embeddings (id, owner_id, embedding, content_type, source)
             SELECT ?1, ?2, ?3, ch.content_type,
                    (SELECT source FROM conversations WHERE id = ch.thread_id)
             FROM chunks ch WHERE ch.id = ?2",
            Some("UPDATE chunks SET embedding_id = ?1 WHERE id = ?2"),
            "chunk",
            rows,
        )
        .await
    }

    pub async fn insert_summary_embedding(
        &self,
        conversation_id: &str,
        vector: &[f32],
    ) -> Result<String> {
        let ids = self
            .insert_embedding_rows(
                "INSERT INTO summary_embeddings (id, owner_id, embedding, source)
                 SELECT ?1, ?2, ?3, c.source FROM conversations c WHERE c.id = ?2",
                Some("UPDATE conversations SET summary_embedding_id = ?1 WHERE id = ?2"),
                "conversation",
                vec![(conversation_id.to_string(), vector.to_vec())],
            )
            .await?;
        Ok(ids.into_iter().next().expect("one id per row"))
    }

    pub async fn insert_content_item_embedding(
        &self,
        item_id: &str,
        vector: &[f32],
    ) -> Result<String> {
        let ids = self
            .insert_content_item_embeddings_batch(vec![(item_id.to_string(), vector.to_vec())])
            .await?;
        Ok(ids.into_iter().next().expect("one id per row"))
    }

    pub async fn insert_content_item_embeddings_batch(
        &self,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Vec<String>> {
        self.insert_embedding_rows(
            "INSERT INTO content_item_embeddings (id, owner_id, embedding, item_type, source)
             SELECT ?1, ?2, ?3, i.item_type, i.source FROM content_items i WHERE i.id = ?2",
            Some("UPDATE content_items SET embedding_id = ?1 WHERE id = ?2"),
            "content item",
            rows,
        )
        .await
    }

    pub async fn insert_content_block_embedding(
        &self,
        block_id: &str,
        vector: &[f32],
    ) -> Result<String> {
        let ids = self
            .insert_content_block_embeddings_batch(vec![(block_id.to_string(), vector.to_vec())])
            .await?;
        Ok(ids.into_iter().next().expect("one id per row"))
    }

    pub async fn insert_content_block_embeddings_batch(
        &self,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Vec<String>> {
        self.insert_embedding_rows(
            "INSERT INTO content_block_embeddings (id, owner_id, embedding, block_type, gizmo_id)
             SELECT ?1, ?2, ?3, b.block_type, b.gizmo_id FROM content_blocks b WHERE b.id = ?2",
            Some("UPDATE content_blocks SET embedding_id = ?1 WHERE id = ?2"),
            "content block",
            rows,
        )
        .await
    }

    /// Raw vector for one message, for invariant checks and re-ranking.
    pub async fn get_message_embedding(&self, message_id: &str) -> Result<Option<Vec<f32>>> {
        let message_id = message_id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    "SELECT embedding FROM message_embeddings WHERE owner_id = ?1",
                    [&message_id],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
            .map(|blob| blob.map(|b| blob_to_vec(&b)))
    }

    /// Dense search over message embeddings, optionally pre-filtered by
    /// role.
    pub async fn search_messages(
        &self,
        query: &[f32],
        limit: usize,
        role: Option<Role>,
    ) -> Result<Vec<MessageHit>> {
        self.ensure_dimensions(query)?;
        let param = query_param(query);
        let role = role.map(|r| r.as_str().to_string());
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT m.id, m.content, m.conversation_id, c.title, c.folder, m.role,
                                c.metadata,
                                vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance
                         FROM message_embeddings e
                         JOIN messages m ON m.id = e.owner_id
                         JOIN conversations c ON c.id = m.conversation_id
                         WHERE (?2 IS NULL OR e.role = ?2)
                         ORDER BY distance ASC
                         LIMIT ?3",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((param, role, limit as i64), |row| {
                        Ok(MessageHit {
                            id: row.get(0)?,
                            content: row.get(1)?,
                            conversation_id: row.get(2)?,
                            conversation_title: row.get(3)?,
                            conversation_folder: row.get(4)?,
                            message_role: Role::parse(&row.get::<_, String>(5)?),
                            metadata: parse_json_column(row.get(6)?),
                            similarity: 1.0 - row.get::<_, f64>(7)? as f32,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(Rusqlite)?);
                }
                Ok(hits)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Dense search over chunk embeddings, optionally restricted to a set
    /// of content types.
    pub async fn search_chunks(
        &self,
        query: &[f32],
        limit: usize,
        content_types: Option<&[ContentKind]>,
    ) -> Result<Vec<ChunkHit>> {
        self.ensure_dimensions(query)?;
        let param = query_param(query);
        // Enum labels only; safe to inline in the predicate.
        let type_filter = match content_types {
            Some(types) if !types.is_empty() => {
                let list = types
                    .iter()
                    .map(|t| format!("'{}'", t.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("AND e.content_type IN ({list})")
            }
            _ => String::new(),
        };
        let sql = format!(
            "SELECT ch.id, ch.content, ch.thread_id, ch.message_id, ch.chunk_index,
                    ch.content_type, ch.word_count, ch.language,
                    vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance
             FROM chunk_embeddings e
             JOIN chunks ch ON ch.id = e.owner_id
             WHERE 1 = 1 {type_filter}
             ORDER BY distance ASC
             LIMIT ?2"
        );
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((param, limit as i64), |row| {
                        Ok(ChunkHit {
                            id: row.get(0)?,
                            content: row.get(1)?,
                            thread_id: row.get(2)?,
                            message_id: row.get(3)?,
                            chunk_index: row.get(4)?,
                            content_type: ContentKind::parse(&row.get::<_, String>(5)?),
                            word_count: row.get(6)?,
                            language: row.get(7)?,
                            similarity: 1.0 - row.get::<_, f64>(8)? as f32,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(Rusqlite)?);
                }
                Ok(hits)
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn search_content_items(
        &self,
        query: &[f32],
        limit: usize,
        item_type: Option<&str>,
        source: Option<&str>,
    ) -> Result<Vec<ItemHit>> {
        self.ensure_dimensions(query)?;
        let param = query_param(query);
        let item_type = item_type.map(str::to_string);
        let source = source.map(str::to_string);
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT i.id, i.item_type, i.source, i.text, i.title, i.uri,
                                i.created_at, i.metadata,
                                vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance
                         FROM content_item_embeddings e
                         JOIN content_items i ON i.id = e.owner_id
                         WHERE (?2 IS NULL OR e.item_type = ?2)
                           AND (?3 IS NULL OR e.source = ?3)
                         ORDER BY distance ASC
                         LIMIT ?4",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((param, item_type, source, limit as i64), |row| {
                        Ok(ItemHit {
                            id: row.get(0)?,
                            item_type: row.get(1)?,
                            source: row.get(2)?,
                            text: row.get(3)?,
                            title: row.get(4)?,
                            uri: row.get(5)?,
                            created_at: row.get(6)?,
                            metadata: parse_json_column(row.get(7)?),
                            similarity: 1.0 - row.get::<_, f64>(8)? as f32,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(Rusqlite)?);
                }
                Ok(hits)
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn search_content_blocks(
        &self,
        query: &[f32],
        limit: usize,
        block_type: Option<BlockKind>,
        gizmo_id: Option<&str>,
    ) -> Result<Vec<BlockHit>> {
        self.ensure_dimensions(query)?;
        let param = query_param(query);
        let block_type = block_type.map(|b| b.as_str().to_string());
        let gizmo_id = gizmo_id.map(str::to_string);
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT b.id, b.block_type, b.language, b.content,
                                b.parent_message_id, b.parent_conversation_id, b.gizmo_id,
                                vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance
                         FROM content_block_embeddings e
                         JOIN content_blocks b ON b.id = e.owner_id
                         WHERE (?2 IS NULL OR e.block_type = ?2)
                           AND (?3 IS NULL OR e.gizmo_id = ?3)
                         ORDER BY distance ASC
                         LIMIT ?4",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((param, block_type, gizmo_id, limit as i64), |row| {
                        Ok(BlockHit {
                            id: row.get(0)?,
                            block_type: BlockKind::parse(&row.get::<_, String>(1)?),
                            language: row.get(2)?,
                            content: row.get(3)?,
                            parent_message_id: row.get(4)?,
                            parent_conversation_id: row.get(5)?,
                            gizmo_id: row.get(6)?,
                            similarity: 1.0 - row.get::<_, f64>(7)? as f32,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(Rusqlite)?);
                }
                Ok(hits)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Nearest messages to an existing message embedding.
    pub async fn find_similar_to_message(
        &self,
        embedding_id: &str,
        limit: usize,
        exclude_same_conversation: bool,
    ) -> Result<Vec<MessageHit>> {
        let embedding_id = embedding_id.to_string();
        let exists = {
            let id = embedding_id.clone();
            self.connection()
                .call(move |conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM message_embeddings WHERE id = ?1",
                        [&id],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(Rusqlite)
                })
                .await
                .map_err(ArchiveError::from)?
        };
        if exists == 0 {
            return Err(ArchiveError::not_found(format!(
                "message embedding {embedding_id}"
            )));
        }

        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT m.id, m.content, m.conversation_id, c.title, c.folder, m.role,
                                c.metadata,
                                vec_distance_cosine(
                                    e.embedding,
                                    (SELECT embedding FROM message_embeddings WHERE id = ?1)
                                ) AS distance
                         FROM message_embeddings e
                         JOIN messages m ON m.id = e.owner_id
                         JOIN conversations c ON c.id = m.conversation_id
                         WHERE e.id != ?1
                           AND (?2 = 0 OR m.conversation_id != (
                                SELECT m2.conversation_id
                                FROM message_embeddings e2
                                JOIN messages m2 ON m2.id = e2.owner_id
                                WHERE e2.id = ?1))
                         ORDER BY distance ASC
                         LIMIT ?3",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map(
                        (embedding_id, exclude_same_conversation as i64, limit as i64),
                        |row| {
                            Ok(MessageHit {
                                id: row.get(0)?,
                                content: row.get(1)?,
                                conversation_id: row.get(2)?,
                                conversation_title: row.get(3)?,
                                conversation_folder: row.get(4)?,
                                message_role: Role::parse(&row.get::<_, String>(5)?),
                                metadata: parse_json_column(row.get(6)?),
                                similarity: 1.0 - row.get::<_, f64>(7)? as f32,
                            })
                        },
                    )
                    .map_err(Rusqlite)?;
                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(Rusqlite)?);
                }
                Ok(hits)
            })
            .await
            .map_err(ArchiveError::from)
    }
}
