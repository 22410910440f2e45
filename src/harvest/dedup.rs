//! Near-duplicate suppression for harvest results.
//!
//! Two strategies, combinable: a normalized fixed-length prefix set, and
//! Jaccard similarity over normalized word sets. Duplicates are dropped,
//! never merged.

use rustc_hash::FxHashSet;

use crate::config::{DedupMethod, DeduplicationConfig};

/// Stateful duplicate detector for one harvest run.
pub struct Deduplicator {
    method: DedupMethod,
    prefix_length: usize,
    jaccard_threshold: f64,
    seen_prefixes: FxHashSet<String>,
    seen_word_sets: Vec<FxHashSet<String>>,
}

impl Deduplicator {
    pub fn new(config: &DeduplicationConfig) -> Self {
        Self {
            method: config.method,
            prefix_length: config.prefix_length.max(1),
            jaccard_threshold: config.jaccard_threshold,
            seen_prefixes: FxHashSet::default(),
            seen_word_sets: Vec::new(),
        }
    }

    /// Checks `text` against everything accepted so far; a non-duplicate is
    /// registered as seen.
    pub fn is_duplicate(&mut self, text: &str) -> bool {
        let normalized = normalize(text);

        let prefix_dup = matches!(self.method, DedupMethod::Prefix | DedupMethod::Both) && {
            let prefix: String = normalized.chars().take(self.prefix_length).collect();
            self.seen_prefixes.contains(&prefix)
        };

        let jaccard_dup = matches!(self.method, DedupMethod::Jaccard | DedupMethod::Both) && {
            let words = word_set(&normalized);
            !words.is_empty()
                && self
                    .seen_word_sets
                    .iter()
                    .any(|seen| jaccard(seen, &words) >= self.jaccard_threshold)
        };

        let duplicate = match self.method {
            DedupMethod::Prefix => prefix_dup,
            DedupMethod::Jaccard => jaccard_dup,
            // Either signal is enough to drop.
            DedupMethod::Both => prefix_dup || jaccard_dup,
        };

        if !duplicate {
            if matches!(self.method, DedupMethod::Prefix | DedupMethod::Both) {
                self.seen_prefixes
                    .insert(normalized.chars().take(self.prefix_length).collect());
            }
            if matches!(self.method, DedupMethod::Jaccard | DedupMethod::Both) {
                self.seen_word_sets.push(word_set(&normalized));
            }
        }
        duplicate
    }
}

/// Lowercase, alphanumeric-only, single-spaced.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn word_set(normalized: &str) -> FxHashSet<String> {
    normalized.split_whitespace().map(str::to_string).collect()
}

fn jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = (a.len() + b.len()) as f64 - intersection;
    if union == 0.0 { 0.0 } else { intersection / union }
}
