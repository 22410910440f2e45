//! Content-aware chunking over segmented text.
//!
//! Prose segments are packed paragraph-by-paragraph toward a target word
//! count; paragraphs that are themselves oversize split on sentence
//! boundaries. Code, math, tables, headings, and lists stay atomic: one
//! segment, one chunk. Every chunk's `content` is the exact byte slice
//! `text[start_offset..end_offset]` of the source, so stored chunks can be
//! re-validated against their parent message.

use unicode_segmentation::UnicodeSegmentation;

use crate::model::ContentKind;

use super::segmenter::{Segment, segment};

#[derive(Clone, Copy, Debug)]
pub struct ChunkerConfig {
    /// Word budget a packed prose chunk aims for.
    pub target_prose_words: usize,
    /// Hard word ceiling; larger paragraphs split on sentence boundaries.
    pub max_chunk_words: usize,
    /// Context window captured around each chunk, in chars.
    pub context_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_prose_words: 150,
            max_chunk_words: 500,
            context_chars: 100,
        }
    }
}

/// A chunk produced by the chunker, not yet bound to a thread or index.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkPiece {
    pub content: String,
    pub content_type: ContentKind,
    pub language: Option<String>,
    pub start_offset: usize,
    pub end_offset: usize,
    pub word_count: usize,
    pub token_count: usize,
    pub context_before: Option<String>,
    pub context_after: Option<String>,
}

/// Segments `text` and chunks the result in one call.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<ChunkPiece> {
    chunk_segments(text, &segment(text), config)
}

/// Chunks `text` as plain prose, skipping content-type analysis. Used when
/// content-aware chunking is switched off.
pub fn chunk_plain(text: &str, config: &ChunkerConfig) -> Vec<ChunkPiece> {
    let whole = Segment {
        kind: ContentKind::Prose,
        language: None,
        start: 0,
        end: text.len(),
        content: text.to_string(),
    };
    chunk_segments(text, &[whole], config)
}

/// Turns typed segments into retrieval chunks.
pub fn chunk_segments(text: &str, segments: &[Segment], config: &ChunkerConfig) -> Vec<ChunkPiece> {
    let mut pieces = Vec::new();
    for seg in segments {
        match seg.kind {
            ContentKind::Prose => chunk_prose(text, seg, config, &mut pieces),
            _ => {
                if !seg.content.trim().is_empty() {
                    pieces.push(make_piece(
                        text,
                        seg.start,
                        seg.end,
                        seg.kind,
                        seg.language.clone(),
                        config,
                    ));
                }
            }
        }
    }
    pieces
}

fn word_count(text: &str) -> usize {
    text.unicode_words().count()
}

fn token_estimate(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn make_piece(
    text: &str,
    start: usize,
    end: usize,
    kind: ContentKind,
    language: Option<String>,
    config: &ChunkerConfig,
) -> ChunkPiece {
    let content = &text[start..end];
    ChunkPiece {
        content: content.to_string(),
        content_type: kind,
        language,
        start_offset: start,
        end_offset: end,
        word_count: word_count(content),
        token_count: token_estimate(content),
        context_before: context_before(text, start, config.context_chars),
        context_after: context_after(text, end, config.context_chars),
    }
}

fn context_before(text: &str, start: usize, n: usize) -> Option<String> {
    if start == 0 || n == 0 {
        return None;
    }
    let window: String = text[..start]
        .chars()
        .rev()
        .take(n)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if window.trim().is_empty() {
        None
    } else {
        Some(window)
    }
}

fn context_after(text: &str, end: usize, n: usize) -> Option<String> {
    if end >= text.len() || n == 0 {
        return None;
    }
    let window: String = text[end..].chars().take(n).collect();
    if window.trim().is_empty() {
        None
    } else {
        Some(window)
    }
}

/// Byte spans of the non-empty paragraphs inside `[seg.start, seg.end)`.
fn paragraph_spans(text: &str, seg: &Segment) -> Vec<(usize, usize)> {
    let run = &text[seg.start..seg.end];
    let mut spans = Vec::new();
    let mut cursor = 0usize;
    for part in run.split("\n\n") {
        let len = part.len();
        if !part.trim().is_empty() {
            // Tighten to the non-whitespace extent so chunk content never
            // starts or ends mid-blank-run.
            let leading = len - part.trim_start().len();
            let trailing = len - part.trim_end().len();
            spans.push((seg.start + cursor + leading, seg.start + cursor + len - trailing));
        }
        cursor += len + 2;
    }
    spans
}

fn chunk_prose(text: &str, seg: &Segment, config: &ChunkerConfig, pieces: &mut Vec<ChunkPiece>) {
    let mut open: Option<(usize, usize, usize)> = None; // (start, end, words)

    let flush = |open: &mut Option<(usize, usize, usize)>, pieces: &mut Vec<ChunkPiece>| {
        if let Some((start, end, _)) = open.take() {
            pieces.push(make_piece(text, start, end, ContentKind::Prose, None, config));
        }
    };

    for (para_start, para_end) in paragraph_spans(text, seg) {
        let para_words = word_count(&text[para_start..para_end]);

        if para_words > config.max_chunk_words {
            flush(&mut open, pieces);
            split_oversize_paragraph(text, para_start, para_end, config, pieces);
            continue;
        }

        match open {
            Some((start, _, words)) if words + para_words <= config.target_prose_words => {
                open = Some((start, para_end, words + para_words));
            }
            Some(_) => {
                flush(&mut open, pieces);
                open = Some((para_start, para_end, para_words));
            }
            None => {
                open = Some((para_start, para_end, para_words));
            }
        }
    }
    flush(&mut open, pieces);
}

/// Splits one oversize paragraph on sentence boundaries, packing whole
/// sentences up to the max word budget.
fn split_oversize_paragraph(
    text: &str,
    para_start: usize,
    para_end: usize,
    config: &ChunkerConfig,
    pieces: &mut Vec<ChunkPiece>,
) {
    let paragraph = &text[para_start..para_end];
    let mut open: Option<(usize, usize, usize)> = None;
    let mut cursor = 0usize;

    for sentence in paragraph.split_sentence_bounds() {
        let s_start = para_start + cursor;
        let s_end = s_start + sentence.len();
        cursor += sentence.len();
        let s_words = word_count(sentence);
        if s_words == 0 {
            if let Some((_, ref mut end, _)) = open {
                *end = s_end;
            }
            continue;
        }

        match open {
            Some((start, _, words)) if words + s_words <= config.max_chunk_words => {
                open = Some((start, s_end, words + s_words));
            }
            Some((start, end, _)) => {
                pieces.push(make_piece(text, start, end, ContentKind::Prose, None, config));
                open = Some((s_start, s_end, s_words));
            }
            None => {
                open = Some((s_start, s_end, s_words));
            }
        }
    }
    if let Some((start, end, _)) = open {
        pieces.push(make_piece(text, start, end, ContentKind::Prose, None, config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkerConfig {
        ChunkerConfig::default()
    }

    #[test]
    fn chunk_content_matches_source_slice() {
        let text = "First paragraph with several words in it.\n\nSecond paragraph, also short.\n\n```rust\nlet x = 1;\n```\n";
        for piece in chunk_text(text, &config()) {
            assert_eq!(&text[piece.start_offset..piece.end_offset], piece.content);
        }
    }

    #[test]
    fn short_paragraphs_pack_together() {
        let text = "One short paragraph.\n\nAnother short paragraph.\n\nA third one.";
        let pieces = chunk_text(text, &config());
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].content.contains("third"));
    }

    #[test]
    fn packing_respects_target_words() {
        let paragraph = "word ".repeat(100).trim_end().to_string();
        let text = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let pieces = chunk_text(&text, &config());
        // 100 words each against a 150 target: no two paragraphs fit together.
        assert_eq!(pieces.len(), 3);
        for piece in &pieces {
            assert!(piece.word_count <= 150);
        }
    }

    #[test]
    fn oversize_paragraph_splits_on_sentences() {
        let sentence = "This sentence has exactly seven words total. ";
        let text = sentence.repeat(120); // ~840 words, one paragraph
        let pieces = chunk_text(&text, &config());
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.word_count <= 500, "piece of {} words", piece.word_count);
            assert!(piece.content.trim_end().ends_with('.'));
            assert_eq!(&text[piece.start_offset..piece.end_offset], piece.content);
        }
    }

    #[test]
    fn code_segments_stay_atomic() {
        let body = "let value = 1;\n".repeat(400);
        let text = format!("```rust\n{body}```\n");
        let pieces = chunk_text(&text, &config());
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].content_type, ContentKind::Code);
        assert_eq!(pieces[0].language.as_deref(), Some("rust"));
    }

    #[test]
    fn chunks_carry_context_windows() {
        let text = "A first anchor paragraph for context.\n\n```py\nx = 1\n```\n\nA closing paragraph after the code block.";
        let pieces = chunk_text(text, &config());
        let code = pieces
            .iter()
            .find(|p| p.content_type == ContentKind::Code)
            .unwrap();
        assert!(code.context_before.as_deref().unwrap().contains("anchor"));
        assert!(code.context_after.as_deref().unwrap().contains("closing"));
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        let text = "abcdefgh";
        let pieces = chunk_text(text, &config());
        assert_eq!(pieces[0].token_count, 2);
    }
}
