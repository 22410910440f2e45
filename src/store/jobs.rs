//! Import-job rows: lifecycle state for the import pipeline.

use crate::errors::Rusqlite;
use tokio_rusqlite::{OptionalExtension, params_from_iter, types::Value};

use crate::errors::{ArchiveError, Result};
use crate::model::{ImportJob, JobCounters, JobStatus};

use super::{ArchiveStore, parse_string_array};

const JOB_COLUMNS: &str = "id, status, source_type, source_path, source_name, progress, \
     current_phase, current_item, units_total, units_processed, media_total, \
     media_processed, errors_count, error_log, created_at_ms, started_at_ms, completed_at_ms";

impl ArchiveStore {
    pub async fn insert_import_job(&self, job: &ImportJob) -> Result<()> {
        let j = job.clone();
        self.connection()
            .call(move |conn| {
                // 17 columns: past the tuple Params limit, bound as values.
                let params: Vec<Value> = vec![
                    j.id.clone().into(),
                    j.status.as_str().to_string().into(),
                    j.source_type.clone().into(),
                    j.source_path.clone().into(),
                    j.source_name.clone().into(),
                    j.progress.into(),
                    j.current_phase.clone().into(),
                    j.current_item.clone().into(),
                    j.counters.units_total.into(),
                    j.counters.units_processed.into(),
                    j.counters.media_total.into(),
                    j.counters.media_processed.into(),
                    j.counters.errors_count.into(),
                    serde_json::to_string(&j.error_log)
                        .unwrap_or_else(|_| "[]".into())
                        .into(),
                    j.created_at_ms.into(),
                    j.started_at_ms.map_or(Value::Null, Value::Integer),
                    j.completed_at_ms.map_or(Value::Null, Value::Integer),
                ];
                conn.execute(
                    "INSERT INTO import_jobs
                         (id, status, source_type, source_path, source_name, progress,
                          current_phase, current_item, units_total, units_processed,
                          media_total, media_processed, errors_count, error_log,
                          created_at_ms, started_at_ms, completed_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params_from_iter(params),
                )
                .map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Writes back the mutable portion of a job row.
    pub async fn update_import_job(&self, job: &ImportJob) -> Result<()> {
        let j = job.clone();
        let changed = self
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE import_jobs SET
                         status = ?2, progress = ?3, current_phase = ?4, current_item = ?5,
                         units_total = ?6, units_processed = ?7, media_total = ?8,
                         media_processed = ?9, errors_count = ?10, error_log = ?11,
                         started_at_ms = ?12, completed_at_ms = ?13
                     WHERE id = ?1",
                    (
                        &j.id,
                        j.status.as_str(),
                        j.progress,
                        &j.current_phase,
                        &j.current_item,
                        j.counters.units_total,
                        j.counters.units_processed,
                        j.counters.media_total,
                        j.counters.media_processed,
                        j.counters.errors_count,
                        serde_json::to_string(&j.error_log).unwrap_or_else(|_| "[]".into()),
                        j.started_at_ms,
                        j.completed_at_ms,
                    ),
                )
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)?;
        if changed == 0 {
            return Err(ArchiveError::not_found(format!("import job {}", job.id)));
        }
        Ok(())
    }

    pub async fn get_import_job(&self, id: &str) -> Result<Option<ImportJob>> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ?1"),
                    [&id],
                    |row| {
                        Ok(ImportJob {
                            id: row.get(0)?,
                            status: JobStatus::parse(&row.get::<_, String>(1)?),
                            source_type: row.get(2)?,
                            source_path: row.get(3)?,
                            source_name: row.get(4)?,
                            progress: row.get(5)?,
                            current_phase: row.get(6)?,
                            current_item: row.get(7)?,
                            counters: JobCounters {
                                units_total: row.get(8)?,
                                units_processed: row.get(9)?,
                                media_total: row.get(10)?,
                                media_processed: row.get(11)?,
                                errors_count: row.get(12)?,
                            },
                            error_log: parse_string_array(row.get(13)?),
                            created_at_ms: row.get(14)?,
                            started_at_ms: row.get(15)?,
                            completed_at_ms: row.get(16)?,
                        })
                    },
                )
                .optional()
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Jobs newest-first, for the import history surface.
    pub async fn list_import_jobs(&self, limit: usize) -> Result<Vec<ImportJob>> {
        self.connection()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {JOB_COLUMNS} FROM import_jobs
                         ORDER BY created_at_ms DESC LIMIT ?1"
                    ))
                    .map_err(Rusqlite)?;
                let rows = stmt
                    .query_map([limit as i64], |row| {
                        Ok(ImportJob {
                            id: row.get(0)?,
                            status: JobStatus::parse(&row.get::<_, String>(1)?),
                            source_type: row.get(2)?,
                            source_path: row.get(3)?,
                            source_name: row.get(4)?,
                            progress: row.get(5)?,
                            current_phase: row.get(6)?,
                            current_item: row.get(7)?,
                            counters: JobCounters {
                                units_total: row.get(8)?,
                                units_processed: row.get(9)?,
                                media_total: row.get(10)?,
                                media_processed: row.get(11)?,
                                errors_count: row.get(12)?,
                            },
                            error_log: parse_string_array(row.get(13)?),
                            created_at_ms: row.get(14)?,
                            started_at_ms: row.get(15)?,
                            completed_at_ms: row.get(16)?,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row.map_err(Rusqlite)?);
                }
                Ok(jobs)
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn delete_import_job(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let changed = self
            .connection()
            .call(move |conn| {
                conn.execute("DELETE FROM import_jobs WHERE id = ?1", [&id])
                    .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)?;
        Ok(changed > 0)
    }
}
