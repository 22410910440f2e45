//! Metadata discovery: adaptive filter facets over the store.
//!
//! A fixed set of declared fields is introspected for coverage, cardinality,
//! and a per-type payload (enum values, date range, numeric range, boolean
//! split). Fields below their coverage floor are omitted, as are degenerate
//! ranges and one-sided booleans, so the filter UI only ever sees facets
//! that can actually narrow something down.
//!
//! Results are cached for an hour behind a mutex; import completion
//! invalidates the cache explicitly.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use crate::errors::Rusqlite;
use tracing::{debug, instrument};

use crate::errors::{ArchiveError, Result};
use crate::model::now_millis;
use crate::store::ArchiveStore;

/// Default facet cache TTL.
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Enum facets with more distinct values than this are dropped.
pub const MAX_DISTINCT: i64 = 50;

/// Default minimum coverage (%) for a field to be worth faceting.
pub const MIN_COVERAGE_PERCENT: f64 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Enum,
    DateRange,
    NumericRange,
    Boolean,
}

/// One declared field to introspect.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// Facet name exposed to the filter UI.
    pub name: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
    /// Coverage floor in percent.
    pub min_coverage: f64,
}

/// The fields the engine introspects by default.
pub fn default_fields() -> Vec<FieldSpec> {
    let field = |name, table, column, kind| FieldSpec {
        name,
        table,
        column,
        kind,
        min_coverage: MIN_COVERAGE_PERCENT,
    };
    vec![
        field("source", "content_items", "source", FieldKind::Enum),
        field("content_type", "content_items", "item_type", FieldKind::Enum),
        field(
            "content_created_at",
            "content_items",
            "created_at",
            FieldKind::DateRange,
        ),
        field("author", "content_items", "author_name", FieldKind::Enum),
        field(
            "is_own_content",
            "content_items",
            "is_own_content",
            FieldKind::Boolean,
        ),
        field(
            "conversation_source",
            "conversations",
            "source",
            FieldKind::Enum,
        ),
        field(
            "conversation_created_at",
            "conversations",
            "created_at",
            FieldKind::DateRange,
        ),
        field(
            "is_interesting",
            "conversations",
            "is_interesting",
            FieldKind::Boolean,
        ),
        field("message_role", "messages", "role", FieldKind::Enum),
        field("block_type", "content_blocks", "block_type", FieldKind::Enum),
        field("chunk_type", "chunks", "content_type", FieldKind::Enum),
        field("language", "chunks", "language", FieldKind::Enum),
        field("word_count", "chunks", "word_count", FieldKind::NumericRange),
        field("image_source", "image_analyses", "source", FieldKind::Enum),
    ]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetValue {
    pub value: String,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FacetPayload {
    Enum { values: Vec<FacetValue> },
    DateRange { min: i64, max: i64 },
    NumericRange { min: f64, max: f64 },
    Boolean { true_count: i64, false_count: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facet {
    pub name: String,
    pub table: String,
    pub column: String,
    pub total_rows: i64,
    pub non_null: i64,
    /// Percent of rows carrying a value.
    pub coverage: f64,
    pub distinct_count: i64,
    #[serde(flatten)]
    pub payload: FacetPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub facets: Vec<Facet>,
    /// Unix milliseconds.
    pub discovered_at_ms: i64,
    pub total_records: i64,
}

/// The discovery service handle.
pub struct MetadataDiscovery {
    store: ArchiveStore,
    fields: Vec<FieldSpec>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, DiscoveryResult)>>,
}

impl MetadataDiscovery {
    pub fn new(store: ArchiveStore) -> Self {
        Self::with_fields(store, default_fields())
    }

    pub fn with_fields(store: ArchiveStore, fields: Vec<FieldSpec>) -> Self {
        Self {
            store,
            fields,
            ttl: CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Drops the cached result; the next call recomputes. Called on import
    /// completion.
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
        debug!("discovery cache invalidated");
    }

    /// Returns the facet set, computing it at most once per TTL window.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> Result<DiscoveryResult> {
        if let Some((at, cached)) = self.cache.lock().as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }

        let result = self.compute().await?;
        *self.cache.lock() = Some((Instant::now(), result.clone()));
        Ok(result)
    }

    async fn compute(&self) -> Result<DiscoveryResult> {
        let mut facets = Vec::new();
        let mut total_records = 0i64;
        let mut counted_tables: Vec<&'static str> = Vec::new();

        for spec in &self.fields {
            let stats = self.field_stats(spec).await?;
            if !counted_tables.contains(&spec.table) {
                counted_tables.push(spec.table);
                total_records += stats.total;
            }
            if stats.total == 0 {
                continue;
            }
            let coverage = stats.non_null as f64 * 100.0 / stats.total as f64;
            if coverage < spec.min_coverage {
                continue;
            }

            let payload = match spec.kind {
                FieldKind::Enum => {
                    if stats.distinct > MAX_DISTINCT {
                        continue;
                    }
                    let values = self.enum_values(spec).await?;
                    if values.is_empty() {
                        continue;
                    }
                    FacetPayload::Enum { values }
                }
                FieldKind::DateRange => {
                    let Some((min, max)) = self.range_i64(spec).await? else {
                        continue;
                    };
                    FacetPayload::DateRange { min, max }
                }
                FieldKind::NumericRange => {
                    let Some((min, max)) = self.range_f64(spec).await? else {
                        continue;
                    };
                    if min == max {
                        continue;
                    }
                    FacetPayload::NumericRange { min, max }
                }
                FieldKind::Boolean => {
                    let (true_count, false_count) = self.boolean_split(spec).await?;
                    if true_count == 0 || false_count == 0 {
                        continue;
                    }
                    FacetPayload::Boolean {
                        true_count,
                        false_count,
                    }
                }
            };

            facets.push(Facet {
                name: spec.name.to_string(),
                table: spec.table.to_string(),
                column: spec.column.to_string(),
                total_rows: stats.total,
                non_null: stats.non_null,
                coverage: (coverage * 10.0).round() / 10.0,
                distinct_count: stats.distinct,
                payload,
            });
        }

        Ok(DiscoveryResult {
            facets,
            discovered_at_ms: now_millis(),
            total_records,
        })
    }

    async fn field_stats(&self, spec: &FieldSpec) -> Result<FieldStats> {
        // Table and column names come from the static field declarations
        // above, never from user input. "Populated" depends on the kind:
        // zero-valued timestamps count as missing, empty strings count as
        // missing for enums.
        let populated = match spec.kind {
            FieldKind::Enum => format!("{col} IS NOT NULL AND {col} != ''", col = spec.column),
            FieldKind::DateRange => format!("{col} IS NOT NULL AND {col} != 0", col = spec.column),
            FieldKind::NumericRange | FieldKind::Boolean => {
                format!("{col} IS NOT NULL", col = spec.column)
            }
        };
        let sql = format!(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN {populated} THEN 1 END),
                    COUNT(DISTINCT {col})
             FROM {table}",
            col = spec.column,
            table = spec.table
        );
        self.store
            .connection()
            .call(move |conn| {
                conn.query_row(&sql, [], |row| {
                    Ok(FieldStats {
                        total: row.get(0)?,
                        non_null: row.get(1)?,
                        distinct: row.get(2)?,
                    })
                })
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    async fn enum_values(&self, spec: &FieldSpec) -> Result<Vec<FacetValue>> {
        let sql = format!(
            "SELECT CAST({col} AS TEXT), COUNT(*) FROM {table}
             WHERE {col} IS NOT NULL AND {col} != ''
             GROUP BY 1 ORDER BY 2 DESC, 1 LIMIT {limit}",
            col = spec.column,
            table = spec.table,
            limit = MAX_DISTINCT
        );
        self.store
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(FacetValue {
                            value: row.get(0)?,
                            count: row.get(1)?,
                        })
                    })
                    .map_err(Rusqlite)?;
                let mut values = Vec::new();
                for row in rows {
                    values.push(row.map_err(Rusqlite)?);
                }
                Ok(values)
            })
            .await
            .map_err(ArchiveError::from)
    }

    async fn range_i64(&self, spec: &FieldSpec) -> Result<Option<(i64, i64)>> {
        let sql = format!(
            "SELECT MIN({col}), MAX({col}) FROM {table} WHERE {col} IS NOT NULL AND {col} != 0",
            col = spec.column,
            table = spec.table
        );
        self.store
            .connection()
            .call(move |conn| {
                conn.query_row(&sql, [], |row| {
                    Ok(match (row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?) {
                        (Some(min), Some(max)) => Some((min, max)),
                        _ => None,
                    })
                })
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    async fn range_f64(&self, spec: &FieldSpec) -> Result<Option<(f64, f64)>> {
        let sql = format!(
            "SELECT MIN({col}), MAX({col}) FROM {table} WHERE {col} IS NOT NULL",
            col = spec.column,
            table = spec.table
        );
        self.store
            .connection()
            .call(move |conn| {
                conn.query_row(&sql, [], |row| {
                    Ok(match (row.get::<_, Option<f64>>(0)?, row.get::<_, Option<f64>>(1)?) {
                        (Some(min), Some(max)) => Some((min, max)),
                        _ => None,
                    })
                })
                .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }

    async fn boolean_split(&self, spec: &FieldSpec) -> Result<(i64, i64)> {
        let sql = format!(
            "SELECT COUNT(CASE WHEN {col} != 0 THEN 1 END),
                    COUNT(CASE WHEN {col} = 0 OR {col} IS NULL THEN 1 END)
             FROM {table}",
            col = spec.column,
            table = spec.table
        );
        self.store
            .connection()
            .call(move |conn| {
                conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)
    }
}

struct FieldStats {
    total: i64,
    non_null: i64,
    distinct: i64,
}
