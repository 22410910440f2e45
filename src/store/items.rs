//! Unified content-item persistence (social posts, comments, notes, …).

use crate::errors::Rusqlite;
use tokio_rusqlite::OptionalExtension;

use crate::errors::{ArchiveError, Result};
use crate::model::ContentItem;

use super::{ArchiveStore, parse_json_column, parse_string_array};

const ITEM_COLUMNS: &str = "id, item_type, source, text, title, created_at, author_name, \
     is_own_content, thread_id, parent_id, media_refs, metadata, uri";

impl ArchiveStore {
    /// Inserts a content item. A duplicate `uri` is a conflict: the URI is
    /// the item's stable external identity and must stay unique.
    pub async fn insert_content_item(&self, item: &ContentItem) -> Result<()> {
        let i = item.clone();
        self.connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO content_items
                         (id, item_type, source, text, title, created_at, author_name,
                          is_own_content, thread_id, parent_id, media_refs, metadata, uri)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                         item_type = excluded.item_type,
                         source = excluded.source,
                         text = excluded.text,
                         title = excluded.title,
                         created_at = excluded.created_at,
                         author_name = excluded.author_name,
                         is_own_content = excluded.is_own_content,
                         thread_id = excluded.thread_id,
                         parent_id = excluded.parent_id,
                         media_refs = excluded.media_refs,
                         metadata = excluded.metadata,
                         uri = excluded.uri",
                    (
                        &i.id,
                        &i.item_type,
                        &i.source,
                        &i.text,
                        &i.title,
                        i.created_at,
                        &i.author_name,
                        i.is_own_content as i64,
                        &i.thread_id,
                        &i.parent_id,
                        serde_json::to_string(&i.media_refs).unwrap_or_else(|_| "[]".into()),
                        i.metadata.to_string(),
                        &i.uri,
                    ),
                )
                .map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn get_content_item(&self, id: &str) -> Result<Option<ContentItem>> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {ITEM_COLUMNS} FROM content_items WHERE id = ?1"),
                    [&id],
                    |row| {
                        Ok(ContentItem {
                            id: row.get(0)?,
                            item_type: row.get(1)?,
                            source: row.get(2)?,
                            text: row.get(3)?,
                            title: row.get(4)?,
                            created_at: row.get(5)?,
                            author_name: row.get(6)?,
                            is_own_content: row.get::<_, i64>(7)? != 0,
                            thread_id: row.get(8)?,
                            parent_id: row.get(9)?,
                            media_refs: parse_string_array(row.get(10)?),
                            metadata: parse_json_column(row.get(11)?),
                            uri: row.get(12)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Looks an item up by its stable URI.
    pub async fn get_content_item_by_uri(&self, uri: &str) -> Result<Option<ContentItem>> {
        let uri = uri.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {ITEM_COLUMNS} FROM content_items WHERE uri = ?1"),
                    [&uri],
                    |row| {
                        Ok(ContentItem {
                            id: row.get(0)?,
                            item_type: row.get(1)?,
                            source: row.get(2)?,
                            text: row.get(3)?,
                            title: row.get(4)?,
                            created_at: row.get(5)?,
                            author_name: row.get(6)?,
                            is_own_content: row.get::<_, i64>(7)? != 0,
                            thread_id: row.get(8)?,
                            parent_id: row.get(9)?,
                            media_refs: parse_string_array(row.get(10)?),
                            metadata: parse_json_column(row.get(11)?),
                            uri: row.get(12)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Whether any local row answers to this URI, trying an exact match
    /// first and an id-suffix fallback second.
    pub async fn uri_resolves(&self, uri: &str) -> Result<bool> {
        let uri = uri.to_string();
        self.connection()
            .call(move |conn| {
                let exact: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM content_items WHERE uri = ?1",
                        [&uri],
                        |row| row.get(0),
                    )
                    .map_err(Rusqlite)?;
                if exact > 0 {
                    return Ok(true);
                }
                let Some(id_segment) = uri.rsplit('/').next().filter(|s| !s.is_empty()) else {
                    return Ok(false);
                };
                let by_id: i64 = conn
                    .query_row(
                        "SELECT (SELECT COUNT(*) FROM content_items WHERE id = ?1)
                              + (SELECT COUNT(*) FROM conversations WHERE id = ?1)
                              + (SELECT COUNT(*) FROM messages WHERE id = ?1)",
                        [id_segment],
                        |row| row.get(0),
                    )
                    .map_err(Rusqlite)?;
                Ok(by_id > 0)
            })
            .await
            .map_err(ArchiveError::from)
    }
}
