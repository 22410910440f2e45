//! Content-block persistence.

use crate::errors::Rusqlite;
use tokio_rusqlite::OptionalExtension;

use crate::errors::{ArchiveError, Result};
use crate::model::{BlockKind, ContentBlock};

use super::{ArchiveStore, parse_json_column};

const BLOCK_COLUMNS: &str = "id, parent_message_id, parent_conversation_id, block_type, \
     language, content, start_offset, end_offset, gizmo_id, created_at, metadata, embedding_id";

impl ArchiveStore {
    pub async fn insert_content_block(&self, block: &ContentBlock) -> Result<()> {
        self.insert_content_blocks_batch(vec![block.clone()]).await
    }

    /// Transactional batch insert of one message's blocks.
    pub async fn insert_content_blocks_batch(&self, blocks: Vec<ContentBlock>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction().map_err(Rusqlite)?;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT INTO content_blocks
                                 (id, parent_message_id, parent_conversation_id, block_type,
                                  language, content, start_offset, end_offset, gizmo_id,
                                  created_at, metadata)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        )
                        .map_err(Rusqlite)?;
                    for block in &blocks {
                        stmt.execute((
                            &block.id,
                            &block.parent_message_id,
                            &block.parent_conversation_id,
                            block.block_type.as_str(),
                            &block.language,
                            &block.content,
                            block.start_offset as i64,
                            block.end_offset as i64,
                            &block.gizmo_id,
                            block.created_at,
                            block.metadata.to_string(),
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

    pub async fn get_content_block(&self, id: &str) -> Result<Option<ContentBlock>> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {BLOCK_COLUMNS} FROM content_blocks WHERE id = ?1"),
                    [&id],
                    |row| {
                        Ok(ContentBlock {
                            id: row.get(0)?,
                            parent_message_id: row.get(1)?,
                            parent_conversation_id: row.get(2)?,
                            block_type: BlockKind::parse(&row.get::<_, String>(3)?),
                            language: row.get(4)?,
                            content: row.get(5)?,
                            start_offset: row.get::<_, i64>(6)? as usize,
                            end_offset: row.get::<_, i64>(7)? as usize,
                            gizmo_id: row.get(8)?,
                            created_at: row.get(9)?,
                            metadata: parse_json_column(row.get(10)?),
                            embedding_id: row.get(11)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Blocks extracted from one message, in offset order.
    pub async fn get_blocks_for_message(&self, message_id: &str) -> Result<Vec<ContentBlock>> {
        let message_id = message_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {BLOCK_COLUMNS} FROM content_blocks
                         WHERE parent_message_id = ?1 ORDER BY start_offset"
                    ))
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map([&message_id], |row| {
                        Ok(ContentBlock {
                            id: row.get(0)?,
                            parent_message_id: row.get(1)?,
                            parent_conversation_id: row.get(2)?,
                            block_type: BlockKind::parse(&row.get::<_, String>(3)?),
                            language: row.get(4)?,
                            content: row.get(5)?,
                            start_offset: row.get::<_, i64>(6)? as usize,
                            end_offset: row.get::<_, i64>(7)? as usize,
                            gizmo_id: row.get(8)?,
                            created_at: row.get(9)?,
                            metadata: parse_json_column(row.get(10)?),
                            embedding_id: row.get(11)?,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut blocks = Vec::new();
                for row in rows {
                    blocks.push(row.map_err(Rusqlite)?);
                }
                Ok(blocks)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Marks a block as having failed embedding without dropping the row.
    pub async fn mark_block_embedding_failed(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE content_blocks
                     SET metadata = json_set(metadata, '$.embeddingFailed', json('true'))
                     WHERE id = ?1",
                    [&id],
                )
                .map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }
}
