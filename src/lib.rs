//! Palimpsest: a local-first personal archive engine.
//!
//! ```text
//! archive folders ──► walker ──► indexer ──┬─► analysis (segment / chunk / blocks)
//!                                          ├─► embedding backend client
//!                                          └─► store (SQLite + sqlite-vec + FTS5)
//!
//! query ──► harvest ──► hybrid search ──► store
//!                  └──► grading / dedup / breadcrumb expansion
//!
//! discovery, links ──► store (read-only)
//! imports ──► parsers ──► store ──► indexer
//! ```
//!
//! The crate exposes a handful of service handles (`ArchiveStore`,
//! `ArchiveIndexer`, `HarvestService`, `MetadataDiscovery`, `LinkGraph`)
//! that an embedding application wires to its HTTP surface; everything else
//! is internal plumbing. See [`registry`] for the lifecycle of those
//! handles when the active archive path changes.

pub mod analysis;
pub mod config;
pub mod discovery;
pub mod embedding;
pub mod errors;
pub mod harvest;
pub mod import;
pub mod indexer;
pub mod links;
pub mod model;
pub mod progress;
pub mod registry;
pub mod search;
pub mod store;
pub mod walker;

pub use config::ServiceConfig;
pub use errors::{ArchiveError, Result};
pub use indexer::{ArchiveIndexer, IndexerOptions};
pub use store::ArchiveStore;
