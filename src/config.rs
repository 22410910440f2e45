//! Persistent service configuration.
//!
//! The config lives as JSON under the user config dir
//! (`<config>/palimpsest/config.json`). Missing keys merge against compiled
//! defaults at load time via `#[serde(default)]`, so old config files keep
//! working as sections grow. Writes are atomic: serialize to a temp file in
//! the same directory, then rename over the target.
//!
//! Rate limiting is an external collaborator and keeps its own config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::errors::{ArchiveError, Result};

/// Deduplication strategy for harvest candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMethod {
    Prefix,
    Jaccard,
    Both,
}

impl Default for DedupMethod {
    fn default() -> Self {
        DedupMethod::Prefix
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeduplicationConfig {
    pub method: DedupMethod,
    pub prefix_length: usize,
    pub jaccard_threshold: f64,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            method: DedupMethod::Prefix,
            prefix_length: 100,
            jaccard_threshold: 0.8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarvestConfig {
    pub default_target: usize,
    pub search_limit: usize,
    pub min_word_count: usize,
    pub expand_breadcrumbs: bool,
    pub context_size: usize,
    pub prioritize_conversations: bool,
    pub min_grade: f64,
    pub length_bonus_max: f64,
    pub length_bonus_divisor: f64,
    pub use_hybrid_search: bool,
    pub deduplication: DeduplicationConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            default_target: 20,
            search_limit: 100,
            min_word_count: 75,
            expand_breadcrumbs: true,
            context_size: 3,
            prioritize_conversations: true,
            min_grade: 2.5,
            length_bonus_max: 0.05,
            length_bonus_divisor: 2000.0,
            use_hybrid_search: true,
            deduplication: DeduplicationConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub health_ttl_ms: u64,
    pub search_debounce_ms: u64,
    pub embedding_cache_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            health_ttl_ms: 30_000,
            search_debounce_ms: 250,
            embedding_cache_ttl_ms: 3_600_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityGateConfig {
    pub target_count: usize,
    pub search_limit: usize,
    pub min_quality: f64,
    pub min_word_count: usize,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            target_count: 20,
            search_limit: 100,
            min_quality: 2.5,
            min_word_count: 75,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HybridConfig {
    pub dense_weight: f64,
    pub sparse_weight: f64,
    pub limit: usize,
    pub fusion_k: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            dense_weight: 0.6,
            sparse_weight: 0.25,
            limit: 20,
            fusion_k: 60.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalConfig {
    pub quality_gate: QualityGateConfig,
    pub hybrid: HybridConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            quality_gate: QualityGateConfig::default(),
            hybrid: HybridConfig::default(),
        }
    }
}

/// Pyramid summarization knobs (conversation summaries and their apex).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PyramidConfig {
    pub chunks_per_summary: usize,
    pub target_summary_words: usize,
    pub target_apex_words: usize,
    pub summarization_model: String,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            chunks_per_summary: 8,
            target_summary_words: 150,
            target_apex_words: 400,
            summarization_model: "llama3.2".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingsConfig {
    /// Fixed vector dimension; every stored embedding must match.
    pub dimensions: usize,
    pub batch_size: usize,
    /// Hard ceiling before the embed-split policy kicks in.
    pub max_chunk_chars: usize,
    pub target_chunk_chars: usize,
    pub min_chunk_chars: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            dimensions: 768,
            batch_size: 32,
            max_chunk_chars: 8000,
            target_chunk_chars: 4000,
            min_chunk_chars: 100,
        }
    }
}

/// Top-level service configuration, one file per user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub harvest: HarvestConfig,
    pub cache: CacheConfig,
    pub retrieval: RetrievalConfig,
    pub pyramid: PyramidConfig,
    pub embeddings: EmbeddingsConfig,
}

impl ServiceConfig {
    /// Default on-disk location: `<user config dir>/palimpsest/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("palimpsest").join("config.json"))
    }

    /// Loads the config, merging missing keys against defaults. A missing
    /// file yields the defaults rather than an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).await?;
        let config: ServiceConfig = serde_json::from_str(&raw)
            .map_err(|err| ArchiveError::invalid(format!("config parse failed: {err}")))?;
        Ok(config)
    }

    /// Atomically persists the config: write a sibling temp file, then
    /// rename over the destination.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|err| ArchiveError::invalid(format!("config serialize failed: {err}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
