//! Embedding backend client.
//!
//! One trait, [`EmbeddingBackend`], is the only seam between the engine and
//! the local model service. Two implementations satisfy the same contract:
//! [`OllamaBackend`] speaks HTTP to the local service and
//! [`MockEmbeddingBackend`] produces deterministic vectors for tests.
//!
//! The retry-on-oversize ladder ([`EmbeddingBackend::embed_resilient`]) and
//! the chunk-for-embedding policy ([`split_for_embedding`]) are part of the
//! contract, not of one variant; the chunker and the indexer both call the
//! same policy instead of carrying their own thresholds.
//!
//! The backend is the serialization point for all model calls: at most one
//! request is in flight per process.

mod ollama;

pub use ollama::OllamaBackend;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use unicode_segmentation::UnicodeSegmentation;

use crate::errors::{ArchiveError, Result};

/// Target size for one embedding request, ≈ 1000 tokens.
pub const TARGET_EMBED_CHARS: usize = 4000;

/// Contract with the local embedding/summarization service.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a single text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. Implementations may split the slice into
    /// backend-sized sub-batches; order is preserved.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Produce a free-text summary for a prompt.
    async fn summarize(&self, prompt: &str) -> Result<String>;

    /// Cheap availability probe.
    async fn is_available(&self) -> bool;

    /// Vector dimension this backend produces.
    fn dimensions(&self) -> usize;

    /// Embed with the oversize-retry ladder: on a context-too-long error,
    /// retry with the ½ prefix, then the ¼ prefix. The final error
    /// propagates; callers treat it as "embedding omitted", never as a
    /// pipeline abort.
    async fn embed_resilient(&self, text: &str) -> Result<Vec<f32>> {
        match self.embed(text).await {
            Ok(vector) => return Ok(vector),
            Err(err) if err.is_context_too_long() => {}
            Err(err) => return Err(err),
        }
        for divisor in [2usize, 4] {
            let prefix = char_prefix(text, text.chars().count() / divisor);
            match self.embed(prefix).await {
                Ok(vector) => return Ok(vector),
                Err(err) if err.is_context_too_long() && divisor != 4 => continue,
                Err(err) => return Err(err),
            }
        }
        unreachable!("retry ladder always returns from its last rung")
    }
}

/// Longest prefix of `text` holding at most `max_chars` chars, cut on a char
/// boundary so the result is always valid UTF-8.
fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// L2-normalizes a vector in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Mean-pools vectors and L2-normalizes the result.
///
/// All inputs must share one dimension; an empty input is a caller error.
pub fn centroid(vectors: &[Vec<f32>]) -> Result<Vec<f32>> {
    let first = vectors
        .first()
        .ok_or_else(|| ArchiveError::invalid("centroid of zero vectors"))?;
    let dim = first.len();
    let mut pooled = vec![0.0f32; dim];
    for vector in vectors {
        if vector.len() != dim {
            return Err(ArchiveError::invalid(format!(
                "centroid dimension mismatch: {} vs {dim}",
                vector.len()
            )));
        }
        for (acc, v) in pooled.iter_mut().zip(vector) {
            *acc += v;
        }
    }
    let n = vectors.len() as f32;
    for v in pooled.iter_mut() {
        *v /= n;
    }
    l2_normalize(&mut pooled);
    Ok(pooled)
}

/// Splits oversize text into embedding-sized pieces.
///
/// Policy (shared by the chunker and the indexer): aim for `target_chars`
/// per piece, never split mid-sentence, prefer paragraph boundaries, keep
/// source order. A single sentence longer than `target_chars` is the only
/// case that gets a hard character split.
pub fn split_for_embedding(text: &str, target_chars: usize) -> Vec<String> {
    if text.chars().count() <= target_chars {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, pieces: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            pieces.push(trimmed.to_string());
        }
        current.clear();
    };

    for paragraph in text.split("\n\n") {
        if paragraph.trim().is_empty() {
            continue;
        }
        if current.chars().count() + paragraph.chars().count() + 2 > target_chars
            && !current.is_empty()
        {
            flush(&mut current, &mut pieces);
        }
        if paragraph.chars().count() <= target_chars {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }
        // Oversize paragraph: pack whole sentences.
        flush(&mut current, &mut pieces);
        for sentence in paragraph.split_sentence_bounds() {
            if current.chars().count() + sentence.chars().count() > target_chars
                && !current.is_empty()
            {
                flush(&mut current, &mut pieces);
            }
            if sentence.chars().count() > target_chars {
                // Pathological sentence, hard-split at the target size.
                let mut rest = sentence;
                while rest.chars().count() > target_chars {
                    let head = char_prefix(rest, target_chars);
                    pieces.push(head.trim().to_string());
                    rest = &rest[head.len()..];
                }
                current.push_str(rest);
            } else {
                current.push_str(sentence);
            }
        }
        flush(&mut current, &mut pieces);
    }
    flush(&mut current, &mut pieces);
    pieces
}

/// Deterministic embedding backend for tests.
///
/// Vectors are seeded from a hash of the input text, use only non-negative
/// components, and are L2-normalized, so identical texts embed identically
/// and cosine similarity is always defined and non-negative.
pub struct MockEmbeddingBackend {
    dimensions: usize,
    /// Texts the backend pretends are too long, to exercise the ladder.
    oversize_rejections: Mutex<FxHashMap<String, usize>>,
    embed_calls: AtomicUsize,
    available: bool,
}

impl MockEmbeddingBackend {
    pub fn new() -> Self {
        Self::with_dimensions(768)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            oversize_rejections: Mutex::new(FxHashMap::default()),
            embed_calls: AtomicUsize::new(0),
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// How many embed requests (single texts, batches counted per text)
    /// the backend has served.
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::Relaxed)
    }

    /// Makes the next `times` embed calls whose input starts with `prefix`
    /// fail with a context-too-long error.
    pub fn reject_oversize(&self, prefix: impl Into<String>, times: usize) {
        self.oversize_rejections.lock().insert(prefix.into(), times);
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // splitmix64 stream seeded by a djb2-style hash of the text.
        let mut seed = text
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x100_0000_01b3)
            });
        let mut vector = Vec::with_capacity(self.dimensions);
        for _ in 0..self.dimensions {
            seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = seed;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            vector.push((z >> 40) as f32 / (1u64 << 24) as f32);
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if !self.available {
            return Err(ArchiveError::backend_unreachable("mock backend offline", 1000));
        }
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        let mut rejections = self.oversize_rejections.lock();
        let mut hit = None;
        for (key, remaining) in rejections.iter_mut() {
            if *remaining > 0 && text.starts_with(key.as_str()) {
                *remaining -= 1;
                hit = Some((key.clone(), *remaining));
                break;
            }
        }
        if let Some((key, remaining)) = hit {
            if remaining == 0 {
                rejections.remove(&key);
            }
            return Err(ArchiveError::context_too_long("input exceeds context"));
        }
        drop(rejections);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    async fn summarize(&self, prompt: &str) -> Result<String> {
        if !self.available {
            return Err(ArchiveError::backend_unreachable("mock backend offline", 1000));
        }
        let words: Vec<&str> = prompt.unicode_words().take(20).collect();
        Ok(format!("summary: {}", words.join(" ")))
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
