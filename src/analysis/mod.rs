//! Text analysis: segmentation, chunking, and block extraction.
//!
//! ```text
//! message text ──► segmenter::segment ──► typed regions
//!                                   │
//!                                   └─► chunker::chunk_segments ──► retrieval chunks
//!
//! message text ──► blocks::extract_blocks ──► semantic content blocks
//!                  blocks::is_junk         (single gate for "not worth embedding")
//! ```
//!
//! Everything in this module is pure CPU code with deterministic output;
//! the async boundaries live in the indexer and the store.

pub mod blocks;
pub mod chunker;
pub mod segmenter;

pub use blocks::{ExtractedBlock, extract_blocks, is_junk};
pub use chunker::{ChunkPiece, ChunkerConfig, chunk_plain, chunk_segments, chunk_text};
pub use segmenter::{Segment, segment};
