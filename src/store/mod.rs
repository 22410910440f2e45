//! The content graph store: one SQLite file holding relational rows, the
//! per-granularity vector tables, and the FTS mirrors.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │   ArchiveStore   │
//!                  │ (tokio-rusqlite) │
//!                  └────────┬─────────┘
//!            ┌──────────────┼───────────────┐
//!            ▼              ▼               ▼
//!     relational rows   vector tables    FTS5 mirrors
//!     (conversations,   (sqlite-vec      (chunks_fts,
//!      messages, …)      blobs)           images_fts)
//! ```
//!
//! The store is the only mutator of persistent state. Multi-row ingestion
//! writes are transactional per conversation; deletion of an owner row
//! cascades to its embedding rows via foreign keys. Vector ranking uses
//! `vec_distance_cosine` over the pre-filtered candidate rows, which is an
//! exact scan and therefore also the brute-force fallback the query layer
//! relies on.

mod blocks;
mod chunks;
mod conversations;
mod images;
pub mod index;
mod items;
mod jobs;
mod links;
mod schema;
mod vectors;

pub use index::{
    BlockFilter, ChunkIndex, ContentBlockIndex, ContentItemIndex, ImageIndex, ItemFilter,
    MessageIndex, SearchableIndex,
};
pub use links::{DirectedLink, LinkDirection};
pub use vectors::{BlockHit, ChunkHit, ImageHit, ItemHit, MessageHit, SparseHit};

use serde::{Deserialize, Serialize};
use std::os::raw::c_char;
use std::path::Path;
use std::sync::OnceLock;
use tokio_rusqlite::{Connection, ffi};
use tracing::{info, instrument};

use crate::errors::{ArchiveError, Result};

/// File name of the store inside an archive root.
pub const STORE_FILE_NAME: &str = ".embeddings.db";

/// Row counts per entity, for dashboards and sanity checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub conversations: i64,
    pub messages: i64,
    pub chunks: i64,
    pub content_items: i64,
    pub content_blocks: i64,
    pub links: i64,
    pub image_analyses: i64,
    pub embeddings: i64,
}

/// Handle to the single-file archive database.
#[derive(Clone)]
pub struct ArchiveStore {
    conn: Connection,
    dimensions: usize,
    fts_available: bool,
}

impl ArchiveStore {
    /// Opens (or creates) the store at `path`, registering the sqlite-vec
    /// extension and applying any pending forward migrations.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(ArchiveError::invalid("embedding dimensions must be > 0"));
        }
        register_sqlite_vec()?;

        let conn = Connection::open(path.as_ref().to_path_buf())
            .await
            .map_err(|err| ArchiveError::Storage(err.to_string()))?;

        conn.call(|conn| -> std::result::Result<(), tokio_rusqlite::rusqlite::Error> {
            conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(crate::errors::Rusqlite)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .map_err(crate::errors::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| ArchiveError::Storage(err.to_string()))?;

        let applied = migrate(&conn).await?;
        if applied > 0 {
            info!(applied, "applied schema migrations");
        }

        let fts_available = conn
            .call(|conn| -> std::result::Result<bool, tokio_rusqlite::rusqlite::Error> {
                let count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chunks_fts'",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(crate::errors::Rusqlite)?;
                Ok(count > 0)
            })
            .await
            .map_err(|err| ArchiveError::Storage(err.to_string()))?;

        Ok(Self {
            conn,
            dimensions,
            fts_available,
        })
    }

    /// Opens the store at its conventional location inside an archive root.
    pub async fn open_in_archive(archive_root: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        Self::open(archive_root.as_ref().join(STORE_FILE_NAME), dimensions).await
    }

    /// Vector dimension every stored embedding must match.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Whether the sparse (FTS) chunk index is present. The hybrid search
    /// layer degrades to dense-only when it is not.
    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    /// The underlying connection, for operations the typed API does not
    /// cover.
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn ensure_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(ArchiveError::invalid(format!(
                "embedding has {} dims, store expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    /// Row counts across the graph.
    pub async fn get_stats(&self) -> Result<StoreStats> {
        self.conn
            .call(|conn| {
                let count = |sql: &str| -> std::result::Result<i64, tokio_rusqlite::rusqlite::Error> {
                    conn.query_row(sql, [], |row| row.get(0))
                        .map_err(crate::errors::Rusqlite)
                };
                let stats = StoreStats {
                    conversations: count("SELECT COUNT(*) FROM conversations")?,
                    messages: count("SELECT COUNT(*) FROM messages")?,
                    chunks: count("SELECT COUNT(*) FROM chunks")?,
                    content_items: count("SELECT COUNT(*) FROM content_items")?,
                    content_blocks: count("SELECT COUNT(*) FROM content_blocks")?,
                    links: count("SELECT COUNT(*) FROM links")?,
                    image_analyses: count("SELECT COUNT(*) FROM image_analyses")?,
                    embeddings: count(
                        "SELECT (SELECT COUNT(*) FROM message_embeddings)
                              + (SELECT COUNT(*) FROM chunk_embeddings)
                              + (SELECT COUNT(*) FROM summary_embeddings)
                              + (SELECT COUNT(*) FROM content_item_embeddings)
                              + (SELECT COUNT(*) FROM content_block_embeddings)
                              + (SELECT COUNT(*) FROM image_description_embeddings)",
                    )?,
                };
                Ok(stats)
            })
            .await
            .map_err(ArchiveError::from)
    }
}

async fn migrate(conn: &Connection) -> Result<usize> {
    let total = schema::MIGRATIONS.len();
    let applied = conn
        .call(move |conn| -> std::result::Result<i64, tokio_rusqlite::rusqlite::Error> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                     version INTEGER PRIMARY KEY,
                     applied_at_ms INTEGER NOT NULL
                 );",
            )
            .map_err(crate::errors::Rusqlite)?;

            let current: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )
                .map_err(crate::errors::Rusqlite)?;
            Ok(current)
        })
        .await
        .map_err(|err| ArchiveError::Storage(err.to_string()))?;

    if applied as usize > total {
        return Err(ArchiveError::Fatal(format!(
            "database schema v{applied} is newer than this build (v{total})"
        )));
    }

    let mut ran = 0usize;
    for (idx, sql) in schema::MIGRATIONS.iter().enumerate().skip(applied as usize) {
        let version = (idx + 1) as i64;
        let sql = *sql;
        conn.call(move |conn| -> std::result::Result<(), tokio_rusqlite::rusqlite::Error> {
            let tx = conn
                .transaction()
                .map_err(crate::errors::Rusqlite)?;
            tx.execute_batch(sql)
                .map_err(crate::errors::Rusqlite)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at_ms) VALUES (?1, ?2)",
                (version, chrono::Utc::now().timestamp_millis()),
            )
            .map_err(crate::errors::Rusqlite)?;
            tx.commit().map_err(crate::errors::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| ArchiveError::Storage(err.to_string()))?;
        ran += 1;
    }
    Ok(ran)
}

/// Registers sqlite-vec as an auto-extension for every connection this
/// process opens. The crate's entry point carries no arguments in its Rust
/// signature, so it is cast to the shape `sqlite3_auto_extension` expects.
/// The first attempt's outcome is latched; repeat opens just read it.
fn register_sqlite_vec() -> Result<()> {
    static REGISTRATION: OnceLock<std::result::Result<(), String>> = OnceLock::new();

    let outcome = REGISTRATION.get_or_init(|| {
        type ExtensionEntryPoint = unsafe extern "C" fn(
            *mut ffi::sqlite3,
            *mut *mut c_char,
            *const ffi::sqlite3_api_routines,
        ) -> i32;

        unsafe {
            let entry: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let entry =
                std::mem::transmute::<unsafe extern "C" fn(), ExtensionEntryPoint>(entry);
            match ffi::sqlite3_auto_extension(Some(entry)) {
                ffi::SQLITE_OK => Ok(()),
                rc => Err(format!("sqlite-vec auto-extension rejected, sqlite code {rc}")),
            }
        }
    });
    outcome.clone().map_err(ArchiveError::Storage)
}

/// Little-endian f32 blob encoding; the layout sqlite-vec reads natively.
pub(crate) fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

/// Lenient JSON column decode: opaque text degrades to `Null` rather than
/// failing a whole row read.
pub(crate) fn parse_json_column(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(serde_json::Value::Null)
}

pub(crate) fn parse_string_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}
