//! Retrieval: dense + sparse passes and their fusion.

pub mod hybrid;

pub use hybrid::{FusedHit, HybridResults, HybridSearch, reciprocal_rank_fusion};
