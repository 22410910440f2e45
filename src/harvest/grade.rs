//! Stub classification and quick grading of harvest candidates.
//!
//! Both functions are total and deterministic: the same text always yields
//! the same classification and grade, with no model calls involved.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use unicode_segmentation::UnicodeSegmentation;

/// What kind of stub a candidate is, if any. `Optimal` means the text
/// stands on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubKind {
    MediaDominant,
    UrlReference,
    Breadcrumb,
    ShortNote,
    ShortSentence,
    Optimal,
}

/// Quality estimate for one candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickGrade {
    pub stub_kind: StubKind,
    pub word_count: usize,
    /// Overall quality in `[1, 5]`.
    pub overall: f64,
    /// How much surrounding context the text needs, in `[1, 5]`.
    pub necessity: f64,
}

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("url regex"));

static MEDIA_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)!\[[^\]]*\]\(|\[(image|photo|video|audio|attached)[:\]]|\.(png|jpe?g|gif|webp|mp4|mp3|wav)\b")
        .expect("media marker regex")
});

static NOTE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(TODO|NOTE|FIXME|IDEA|REMINDER)\b").expect("note regex"));

static PROPER_NOUN_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b").expect("proper noun regex"));

static NUMBERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d").expect("digit regex"));

const BREADCRUMB_OPENERS: &[&str] = &[
    "in the context of",
    "related to",
    "see also",
    "as discussed",
    "following up on",
    "continuing from",
    "re:",
];

const AFFECT_WORDS: &[&str] = &[
    "love", "hate", "fear", "afraid", "excited", "worried", "happy", "sad", "angry", "anxious",
    "grateful", "frustrated", "proud", "ashamed", "relieved", "hopeful",
];

const ACTION_VERBS: &[&str] = &[
    "build", "create", "fix", "write", "implement", "check", "review", "plan", "schedule",
    "call", "email", "buy", "send", "finish", "draft", "measure", "test",
];

const INSIGHT_MARKERS: &[&str] = &[
    "realized",
    "realised",
    "learned",
    "insight",
    "conclusion",
    "because",
    "therefore",
    "turns out",
    "the key is",
    "in other words",
];

fn word_count(text: &str) -> usize {
    text.unicode_words().count()
}

fn sentence_count(text: &str) -> usize {
    text.split_sentence_bounds()
        .filter(|s| s.unicode_words().next().is_some())
        .count()
}

/// Classifies a candidate into a stub kind. Priority order: media-dominant,
/// URL-dominant reference, breadcrumb opener, short note, short single
/// sentence, else optimal.
pub fn classify_stub(text: &str) -> StubKind {
    let trimmed = text.trim();
    let words = word_count(trimmed);
    let lowered = trimmed.to_lowercase();

    let media_markers = MEDIA_MARKER.find_iter(trimmed).count();
    if media_markers > 0 && words < 12 {
        return StubKind::MediaDominant;
    }

    let url_chars: usize = URL.find_iter(trimmed).map(|m| m.len()).sum();
    if url_chars > 0 && (url_chars * 2 >= trimmed.len() || words < 15) {
        return StubKind::UrlReference;
    }

    if words < 15
        && BREADCRUMB_OPENERS
            .iter()
            .any(|opener| lowered.starts_with(opener))
    {
        return StubKind::Breadcrumb;
    }

    if words < 25 && NOTE_PREFIX.is_match(trimmed) {
        return StubKind::ShortNote;
    }

    if words < 20 && sentence_count(trimmed) <= 1 {
        return StubKind::ShortSentence;
    }

    StubKind::Optimal
}

/// Number of distinct quality signals the text shows, in `0..=5`.
fn signal_count(text: &str) -> usize {
    let lowered = text.to_lowercase();
    let mut signals = 0usize;
    if NUMBERS.is_match(text) {
        signals += 1;
    }
    if PROPER_NOUN_PAIR.is_match(text) {
        signals += 1;
    }
    if AFFECT_WORDS
        .iter()
        .any(|word| lowered.unicode_words().any(|w| w == *word))
    {
        signals += 1;
    }
    if ACTION_VERBS
        .iter()
        .any(|verb| lowered.unicode_words().any(|w| w == *verb))
    {
        signals += 1;
    }
    if INSIGHT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        signals += 1;
    }
    signals
}

/// Grades one candidate from cheap lexical signals.
pub fn grade(text: &str) -> QuickGrade {
    let stub_kind = classify_stub(text);
    let words = word_count(text);
    let signals = signal_count(text);

    let base = match stub_kind {
        StubKind::Optimal => 2.5,
        StubKind::ShortNote => 1.8,
        StubKind::Breadcrumb | StubKind::ShortSentence => 1.5,
        StubKind::UrlReference => 1.2,
        StubKind::MediaDominant => 1.0,
    };
    let length_bonus = match words {
        0..=74 => 0.0,
        75..=199 => 0.5,
        _ => 1.0,
    };
    let overall = (base + 0.4 * signals as f64 + length_bonus).clamp(1.0, 5.0);
    let necessity = match stub_kind {
        StubKind::Optimal => (1.0 + 0.5 * signals as f64).clamp(1.0, 5.0),
        _ => 4.0,
    };

    QuickGrade {
        stub_kind,
        word_count: words,
        overall,
        necessity,
    }
}
