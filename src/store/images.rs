//! Image-analysis rows plus semantic and lexical image search.

use crate::errors::Rusqlite;
use tokio_rusqlite::OptionalExtension;

use crate::errors::{ArchiveError, Result};
use crate::model::ImageAnalysis;

use super::{ArchiveStore, ImageHit, parse_string_array};

const IMAGE_COLUMNS: &str = "id, file_path, file_hash, source, description, categories, \
     objects, scene, mood, model_used, confidence, processing_time_ms";

impl ArchiveStore {
    /// Inserts or replaces the analysis for a file path. One row per path;
    /// re-analysis overwrites in place and the FTS mirror follows via
    /// triggers.
    pub async fn upsert_image_analysis(&self, analysis: &ImageAnalysis) -> Result<()> {
        let a = analysis.clone();
        self.connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO image_analyses
                         (id, file_path, file_hash, source, description, categories,
                          objects, scene, mood, model_used, confidence, processing_time_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(file_path) DO UPDATE SET
                         file_hash = excluded.file_hash,
                         source = excluded.source,
                         description = excluded.description,
                         categories = excluded.categories,
                         objects = excluded.objects,
                         scene = excluded.scene,
                         mood = excluded.mood,
                         model_used = excluded.model_used,
                         confidence = excluded.confidence,
                         processing_time_ms = excluded.processing_time_ms",
                    (
                        &a.id,
                        &a.file_path,
                        &a.file_hash,
                        &a.source,
                        &a.description,
                        serde_json::to_string(&a.categories).unwrap_or_else(|_| "[]".into()),
                        serde_json::to_string(&a.objects).unwrap_or_else(|_| "[]".into()),
                        &a.scene,
                        &a.mood,
                        &a.model_used,
                        a.confidence,
                        a.processing_time_ms,
                    ),
                )
                .map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn get_image_analysis_by_path(&self, file_path: &str) -> Result<Option<ImageAnalysis>> {
        let file_path = file_path.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {IMAGE_COLUMNS} FROM image_analyses WHERE file_path = ?1"),
                    [&file_path],
                    |row| {
                        Ok(ImageAnalysis {
                            id: row.get(0)?,
                            file_path: row.get(1)?,
                            file_hash: row.get(2)?,
                            source: row.get(3)?,
                            description: row.get(4)?,
                            categories: parse_string_array(row.get(5)?),
                            objects: parse_string_array(row.get(6)?),
                            scene: row.get(7)?,
                            mood: row.get(8)?,
                            model_used: row.get(9)?,
                            confidence: row.get(10)?,
                            processing_time_ms: row.get(11)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Stores a description embedding so images participate in semantic
    /// search.
    pub async fn insert_image_description_embedding(
        &self,
        analysis_id: &str,
        vector: &[f32],
    ) -> Result<String> {
        let ids = self
            .insert_embedding_rows(
                "INSERT INTO image_description_embeddings (id, owner_id, embedding, source)
                 SELECT ?1, ?2, ?3, a.source FROM image_analyses a WHERE a.id = ?2",
                None,
                "image analysis",
                vec![(analysis_id.to_string(), vector.to_vec())],
            )
            .await?;
        Ok(ids.into_iter().next().expect("one id per row"))
    }

    /// Dense search over image-description embeddings.
    pub async fn search_images_by_description_vector(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ImageHit>> {
        self.ensure_dimensions(query)?;
        let param = serde_json::to_string(query).expect("f32 slice serializes");
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT a.id, a.file_path, a.description, a.source,
                                vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance
                         FROM image_description_embeddings e
                         JOIN image_analyses a ON a.id = e.owner_id
                         ORDER BY distance ASC
                         LIMIT ?2",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((param, limit as i64), |row| {
                        Ok(ImageHit {
                            id: row.get(0)?,
                            file_path: row.get(1)?,
                            description: row.get(2)?,
                            source: row.get(3)?,
                            score: 1.0 - row.get::<_, f64>(4)? as f32,
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

    /// Lexical search over image descriptions, optionally scoped to one
    /// source.
    pub async fn search_images_fts(
        &self,
        query: &str,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ImageHit>> {
        if !self.fts_available() {
            return Ok(Vec::new());
        }
        let match_expr = query
            .split_whitespace()
            .map(|term| term.replace('"', ""))
            .filter(|term| term.len() >= 2)
            .map(|term| format!("\"{term}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let source = source.map(str::to_string);
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT a.id, a.file_path, a.description, a.source,
                                bm25(images_fts) AS rank
                         FROM images_fts
                         JOIN image_analyses a ON a.id = images_fts.analysis_id
                         WHERE images_fts MATCH ?1
                           AND (?2 IS NULL OR images_fts.source = ?2)
                         ORDER BY rank ASC
                         LIMIT ?3",
                    )
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((match_expr, source, limit as i64), |row| {
                        Ok(ImageHit {
                            id: row.get(0)?,
                            file_path: row.get(1)?,
                            description: row.get(2)?,
                            source: row.get(3)?,
                            score: -row.get::<_, f64>(4)? as f32,
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
