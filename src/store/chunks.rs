//! Chunk persistence and the sparse (FTS) chunk index.
//!
//! Legacy "pyramid" chunks share the table with content-aware chunks; a
//! `pyramid` flag records provenance so both populations stay queryable as
//! one logical grain.

use crate::errors::Rusqlite;
use tokio_rusqlite::OptionalExtension;

use crate::errors::{ArchiveError, Result};
use crate::model::{Chunk, ContentKind};

use super::{ArchiveStore, SparseHit};

const CHUNK_COLUMNS: &str = "id, thread_id, message_id, chunk_index, content, word_count, \
     token_count, content_type, language, start_offset, end_offset, \
     context_before, context_after, embedding_id";

fn chunk_params(
    chunk: &Chunk,
    pyramid: bool,
) -> (
    String,
    String,
    String,
    i64,
    String,
    i64,
    i64,
    &'static str,
    Option<String>,
    i64,
    i64,
    Option<String>,
    Option<String>,
    i64,
) {
    (
        chunk.id.clone(),
        chunk.thread_id.clone(),
        chunk.message_id.clone(),
        chunk.chunk_index,
        chunk.content.clone(),
        chunk.word_count,
        chunk.token_count,
        chunk.content_type.as_str(),
        chunk.language.clone(),
        chunk.start_offset as i64,
        chunk.end_offset as i64,
        chunk.context_before.clone(),
        chunk.context_after.clone(),
        pyramid as i64,
    )
}

const INSERT_CHUNK_SQL: &str = "INSERT INTO chunks
     (id, thread_id, message_id, chunk_index, content, word_count, token_count,
      content_type, language, start_offset, end_offset, context_before, context_after, pyramid)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

impl ArchiveStore {
    /// Inserts one chunk. A duplicate `(thread_id, chunk_index)` pair is a
    /// conflict, never a silent overwrite.
    pub async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let params = chunk_params(chunk, false);
        self.connection()
            .call(move |conn| {
                conn.execute(INSERT_CHUNK_SQL, params).map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Inserts a pyramid-derived chunk; identical storage, flagged origin.
    pub async fn insert_pyramid_chunk(&self, chunk: &Chunk) -> Result<()> {
        let params = chunk_params(chunk, true);
        self.connection()
            .call(move |conn| {
                conn.execute(INSERT_CHUNK_SQL, params).map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Transactional batch insert in source order.
    pub async fn insert_chunks_batch(&self, chunks: Vec<Chunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction().map_err(Rusqlite)?;
                {
                    let mut stmt = tx.prepare(INSERT_CHUNK_SQL).map_err(Rusqlite)?;
                    for chunk in &chunks {
                        stmt.execute(chunk_params(chunk, false)).map_err(Rusqlite)?;
                    }
                }
                tx.commit().map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"),
                    [&id],
                    |row| {
                        Ok(Chunk {
                            id: row.get(0)?,
                            thread_id: row.get(1)?,
                            message_id: row.get(2)?,
                            chunk_index: row.get(3)?,
                            content: row.get(4)?,
                            word_count: row.get(5)?,
                            token_count: row.get(6)?,
                            content_type: ContentKind::parse(&row.get::<_, String>(7)?),
                            language: row.get(8)?,
                            start_offset: row.get::<_, i64>(9)? as usize,
                            end_offset: row.get::<_, i64>(10)? as usize,
                            context_before: row.get(11)?,
                            context_after: row.get(12)?,
                            embedding_id: row.get(13)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Chunks cut from one message, in chunk order.
    pub async fn get_chunks_for_message(&self, message_id: &str) -> Result<Vec<Chunk>> {
        let message_id = message_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {CHUNK_COLUMNS} FROM chunks
                         WHERE message_id = ?1 ORDER BY chunk_index"
                    ))
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map([&message_id], |row| {
                        Ok(Chunk {
                            id: row.get(0)?,
                            thread_id: row.get(1)?,
                            message_id: row.get(2)?,
                            chunk_index: row.get(3)?,
                            content: row.get(4)?,
                            word_count: row.get(5)?,
                            token_count: row.get(6)?,
                            content_type: ContentKind::parse(&row.get::<_, String>(7)?),
                            language: row.get(8)?,
                            start_offset: row.get::<_, i64>(9)? as usize,
                            end_offset: row.get::<_, i64>(10)? as usize,
                            context_before: row.get(11)?,
                            context_after: row.get(12)?,
                            embedding_id: row.get(13)?,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut chunks = Vec::new();
                for row in rows {
                    chunks.push(row.map_err(Rusqlite)?);
                }
                Ok(chunks)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Highest chunk index already used within a thread, if any. The
    /// indexer continues numbering from here so `(thread_id, chunk_index)`
    /// stays unique across re-runs.
    pub async fn max_chunk_index(&self, thread_id: &str) -> Result<Option<i64>> {
        let thread_id = thread_id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    "SELECT MAX(chunk_index) FROM chunks WHERE thread_id = ?1",
                    [&thread_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Sparse lexical pass over chunk content, BM25-ranked. Scores are
    /// negated bm25 values so larger is better, matching the dense pass.
    pub async fn search_chunks_fts(&self, query: &str, limit: usize) -> Result<Vec<SparseHit>> {
        if !self.fts_available() {
            return Ok(Vec::new());
        }
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT chunk_id, bm25(chunks_fts) AS rank
                         FROM chunks_fts
                         WHERE chunks_fts MATCH ?1
                         ORDER BY rank ASC
                         LIMIT ?2",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((match_expr, limit as i64), |row| {
                        Ok(SparseHit {
                            chunk_id: row.get(0)?,
                            score: -row.get::<_, f64>(1)? as f32,
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
}

/// Quotes each query term so user text cannot inject FTS5 syntax.
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| term.len() >= 2)
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("hello \"world\""),
            "\"hello\" OR \"world\""
        );
        assert_eq!(fts_match_expression(""), "");
    }
}
