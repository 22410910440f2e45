//! Conversation and message persistence.

use crate::errors::Rusqlite;
use tokio_rusqlite::OptionalExtension;

use crate::errors::{ArchiveError, Result};
use crate::model::{Conversation, Message, Role};

use super::{ArchiveStore, parse_json_column};

const CONVERSATION_COLUMNS: &str = "id, title, source, folder, created_at, updated_at, \
     message_count, is_interesting, summary, summary_embedding_id, metadata";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, parent_id, created_at, embedding_id";

impl ArchiveStore {
    /// Upserts a conversation by id. Re-imports refresh the descriptive
    /// fields but never clobber the indexer-owned `summary` and
    /// `is_interesting` flags.
    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let c = conversation.clone();
        self.connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conversations
                         (id, title, source, folder, created_at, updated_at,
                          message_count, is_interesting, summary, summary_embedding_id, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(id) DO UPDATE SET
                         title = excluded.title,
                         source = excluded.source,
                         folder = excluded.folder,
                         created_at = excluded.created_at,
                         updated_at = excluded.updated_at,
                         message_count = excluded.message_count,
                         metadata = excluded.metadata",
                    (
                        &c.id,
                        &c.title,
                        &c.source,
                        &c.folder,
                        c.created_at,
                        c.updated_at,
                        c.message_count,
                        c.is_interesting as i64,
                        &c.summary,
                        &c.summary_embedding_id,
                        c.metadata.to_string(),
                    ),
                )
                .map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                    [&id],
                    |row| {
                        Ok(Conversation {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            source: row.get(2)?,
                            folder: row.get(3)?,
                            created_at: row.get(4)?,
                            updated_at: row.get(5)?,
                            message_count: row.get(6)?,
                            is_interesting: row.get::<_, i64>(7)? != 0,
                            summary: row.get(8)?,
                            summary_embedding_id: row.get(9)?,
                            metadata: parse_json_column(row.get(10)?),
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Inserts a conversation's messages in one transaction, preserving the
    /// caller's (BFS) order. Existing rows are refreshed by id without
    /// touching their embedding linkage.
    pub async fn insert_messages_batch(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction().map_err(Rusqlite)?;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT INTO messages
                                 (id, conversation_id, role, content, parent_id, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                             ON CONFLICT(id) DO UPDATE SET
                                 conversation_id = excluded.conversation_id,
                                 role = excluded.role,
                                 content = excluded.content,
                                 parent_id = excluded.parent_id,
                                 created_at = excluded.created_at",
                        )
                        .map_err(Rusqlite)?;
                    for message in &messages {
                        stmt.execute((
                            &message.id,
                            &message.conversation_id,
                            message.role.as_str(),
                            &message.content,
                            &message.parent_id,
                            message.created_at,
                        ))
                        .map_err(Rusqlite)?;
                    }
                }
                tx.commit().map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Messages of one conversation in insertion (BFS) order.
    pub async fn get_messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE conversation_id = ?1 ORDER BY rowid"
                    ))
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map([&conversation_id], |row| {
                        Ok(Message {
                            id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            role: Role::parse(&row.get::<_, String>(2)?),
                            content: row.get(3)?,
                            parent_id: row.get(4)?,
                            created_at: row.get(5)?,
                            embedding_id: row.get(6)?,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row.map_err(Rusqlite)?);
                }
                Ok(messages)
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [&id],
                    |row| {
                        Ok(Message {
                            id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            role: Role::parse(&row.get::<_, String>(2)?),
                            content: row.get(3)?,
                            parent_id: row.get(4)?,
                            created_at: row.get(5)?,
                            embedding_id: row.get(6)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn update_conversation_summary(
        &self,
        id: &str,
        summary: &str,
        summary_embedding_id: Option<&str>,
    ) -> Result<()> {
        let id = id.to_string();
        let summary = summary.to_string();
        let summary_embedding_id = summary_embedding_id.map(str::to_string);
        let changed = self
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE conversations
                     SET summary = ?2, summary_embedding_id = ?3
                     WHERE id = ?1",
                    (&id, &summary, &summary_embedding_id),
                )
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)?;
        if changed == 0 {
            return Err(ArchiveError::not_found("conversation for summary update"));
        }
        Ok(())
    }

    pub async fn mark_conversation_interesting(&self, id: &str, interesting: bool) -> Result<()> {
        let id = id.to_string();
        let changed = self
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE conversations SET is_interesting = ?2 WHERE id = ?1",
                    (&id, interesting as i64),
                )
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)?;
        if changed == 0 {
            return Err(ArchiveError::not_found("conversation for interest flag"));
        }
        Ok(())
    }

    /// Deletes a conversation; messages, chunks, blocks, and every attached
    /// embedding row go with it via cascades.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let changed = self
            .connection()
            .call(move |conn| {
                conn.execute("DELETE FROM conversations WHERE id = ?1", [&id])
                    .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)?;
        Ok(changed > 0)
    }
}
