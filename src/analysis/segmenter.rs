//! Typed-region segmentation of raw message text.
//!
//! [`segment`] splits a text blob into a linear list of [`Segment`]s that
//! cover the whole input without gaps, so concatenating the segment slices
//! in order reproduces the input byte-for-byte. Detection is greedy in a
//! fixed rule order (fenced code, block math, tables, headings, lists,
//! inline math inside prose, then prose), so the output is deterministic.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::ContentKind;

/// One typed region of the input. Offsets are byte offsets into the
/// original text and `content` is the exact slice between them.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub kind: ContentKind,
    pub language: Option<String>,
    pub start: usize,
    pub end: usize,
    pub content: String,
}

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s").expect("heading regex"));

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+\.)\s").expect("list regex"));

static TABLE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\|?\s*(:?-+:?\s*\|\s*)+:?-+:?\s*\|?\s*$").expect("table separator regex")
});

static INLINE_MATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\S(?:[^$\n]*\S)?\$").expect("inline math regex"));

/// Byte spans of each line, trailing newline included.
fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            spans.push((start, idx + 1));
            start = idx + 1;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

/// Segments `text` into typed regions covering the whole input.
pub fn segment(text: &str) -> Vec<Segment> {
    let lines = line_spans(text);
    let mut segments: Vec<Segment> = Vec::new();
    let mut prose_start: Option<usize> = None;
    let mut i = 0usize;

    let flush_prose = |segments: &mut Vec<Segment>, prose_start: &mut Option<usize>, upto: usize| {
        if let Some(start) = prose_start.take() {
            if upto > start {
                emit_prose(text, start, upto, segments);
            }
        }
    };

    while i < lines.len() {
        let (line_start, line_end) = lines[i];
        let line = &text[line_start..line_end];
        let trimmed = line.trim_end_matches('\n').trim();

        // Rule 1: fenced code.
        if trimmed.starts_with("```") {
            flush_prose(&mut segments, &mut prose_start, line_start);
            let language = {
                let tag = trimmed.trim_start_matches('`').trim();
                if tag.is_empty() {
                    None
                } else {
                    Some(tag.to_string())
                }
            };
            let mut j = i + 1;
            let mut end = text.len();
            let mut next = lines.len();
            while j < lines.len() {
                let candidate = text[lines[j].0..lines[j].1].trim_end_matches('\n').trim();
                if candidate.starts_with("```") {
                    end = lines[j].1;
                    next = j + 1;
                    break;
                }
                j += 1;
            }
            segments.push(Segment {
                kind: ContentKind::Code,
                language,
                start: line_start,
                end,
                content: text[line_start..end].to_string(),
            });
            i = next;
            continue;
        }

        // Rule 2: block math, $$ … $$ or \[ … \].
        if let Some((end, next)) = block_math_extent(text, &lines, i, trimmed) {
            flush_prose(&mut segments, &mut prose_start, line_start);
            segments.push(Segment {
                kind: ContentKind::Math,
                language: None,
                start: line_start,
                end,
                content: text[line_start..end].to_string(),
            });
            i = next;
            continue;
        }

        // Rule 4: markdown table (header row + separator row).
        if trimmed.contains('|') && i + 1 < lines.len() {
            let separator = text[lines[i + 1].0..lines[i + 1].1].trim_end_matches('\n');
            if TABLE_SEPARATOR.is_match(separator) {
                flush_prose(&mut segments, &mut prose_start, line_start);
                let mut j = i + 2;
                while j < lines.len() && text[lines[j].0..lines[j].1].contains('|') {
                    j += 1;
                }
                let end = lines[j - 1].1;
                segments.push(Segment {
                    kind: ContentKind::Table,
                    language: None,
                    start: line_start,
                    end,
                    content: text[line_start..end].to_string(),
                });
                i = j;
                continue;
            }
        }

        // Rule 5: heading, anchored at the line start.
        if HEADING.is_match(line) {
            flush_prose(&mut segments, &mut prose_start, line_start);
            segments.push(Segment {
                kind: ContentKind::Heading,
                language: None,
                start: line_start,
                end: line_end,
                content: text[line_start..line_end].to_string(),
            });
            i += 1;
            continue;
        }

        // Rule 6: list run.
        if LIST_ITEM.is_match(line) {
            flush_prose(&mut segments, &mut prose_start, line_start);
            let mut j = i + 1;
            while j < lines.len() && LIST_ITEM.is_match(&text[lines[j].0..lines[j].1]) {
                j += 1;
            }
            let end = lines[j - 1].1;
            segments.push(Segment {
                kind: ContentKind::List,
                language: None,
                start: line_start,
                end,
                content: text[line_start..end].to_string(),
            });
            i = j;
            continue;
        }

        // Rule 7: prose, accumulated until the next structural line.
        if prose_start.is_none() {
            prose_start = Some(line_start);
        }
        i += 1;
    }
    flush_prose(&mut segments, &mut prose_start, text.len());
    segments
}

/// Extent of a block-math region starting at line `i`, if any.
///
/// Returns `(end_byte, next_line_index)`. Unclosed delimiters do not start
/// a math region; the line falls through to later rules.
fn block_math_extent(
    text: &str,
    lines: &[(usize, usize)],
    i: usize,
    trimmed: &str,
) -> Option<(usize, usize)> {
    let (open, close) = if trimmed.starts_with("$$") {
        ("$$", "$$")
    } else if trimmed.starts_with("\\[") {
        ("\\[", "\\]")
    } else {
        return None;
    };

    // Single-line form: `$$ x = y $$` / `\[ x \]`.
    let rest = &trimmed[open.len()..];
    if rest.trim_end().ends_with(close) && !rest.trim().is_empty() {
        return Some((lines[i].1, i + 1));
    }

    for (j, &(line_start, line_end)) in lines.iter().enumerate().skip(i + 1) {
        let candidate = text[line_start..line_end].trim_end_matches('\n').trim();
        if candidate.ends_with(close) {
            return Some((line_end, j + 1));
        }
    }
    None
}

/// Emits a prose run, carving out balanced single-line `$…$` inline math.
fn emit_prose(text: &str, start: usize, end: usize, segments: &mut Vec<Segment>) {
    let run = &text[start..end];
    let mut cursor = 0usize;
    for m in INLINE_MATH.find_iter(run) {
        if m.start() > cursor {
            segments.push(Segment {
                kind: ContentKind::Prose,
                language: None,
                start: start + cursor,
                end: start + m.start(),
                content: run[cursor..m.start()].to_string(),
            });
        }
        segments.push(Segment {
            kind: ContentKind::Math,
            language: None,
            start: start + m.start(),
            end: start + m.end(),
            content: m.as_str().to_string(),
        });
        cursor = m.end();
    }
    if cursor < run.len() {
        segments.push(Segment {
            kind: ContentKind::Prose,
            language: None,
            start: start + cursor,
            end,
            content: run[cursor..].to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(text: &str) -> String {
        segment(text)
            .iter()
            .map(|s| s.content.as_str())
            .collect::<String>()
    }

    #[test]
    fn segments_cover_input_exactly() {
        let text = "# Title\n\nSome prose here.\n\n```rust\nfn main() {}\n```\n\n- one\n- two\n\n| a | b |\n| --- | --- |\n| 1 | 2 |\n\nClosing prose with $x^2$ inline.\n";
        assert_eq!(reassemble(text), text);
    }

    #[test]
    fn fenced_code_carries_language() {
        let text = "before\n```python\nprint('hi')\n```\nafter";
        let segments = segment(text);
        let code = segments
            .iter()
            .find(|s| s.kind == ContentKind::Code)
            .unwrap();
        assert_eq!(code.language.as_deref(), Some("python"));
        assert!(code.content.contains("print('hi')"));
        assert_eq!(&text[code.start..code.end], code.content);
    }

    #[test]
    fn unclosed_fence_runs_to_end() {
        let text = "intro\n```\nno closing fence";
        let segments = segment(text);
        assert_eq!(segments.last().unwrap().kind, ContentKind::Code);
        assert_eq!(reassemble(text), text);
    }

    #[test]
    fn block_math_single_and_multi_line() {
        let text = "$$ e = mc^2 $$\ntext\n$$\na + b\n$$\n";
        let segments = segment(text);
        let math: Vec<_> = segments
            .iter()
            .filter(|s| s.kind == ContentKind::Math)
            .collect();
        assert_eq!(math.len(), 2);
        assert_eq!(reassemble(text), text);
    }

    #[test]
    fn latex_brackets_are_block_math() {
        let text = "\\[\n\\int_0^1 x\\,dx\n\\]\n";
        let segments = segment(text);
        assert_eq!(segments[0].kind, ContentKind::Math);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn inline_math_only_when_balanced() {
        let text = "The value $x+1$ matters, but $5 alone does not.\n";
        let segments = segment(text);
        let math: Vec<_> = segments
            .iter()
            .filter(|s| s.kind == ContentKind::Math)
            .collect();
        assert_eq!(math.len(), 1);
        assert_eq!(math[0].content, "$x+1$");
        assert_eq!(reassemble(text), text);
    }

    #[test]
    fn table_requires_separator_row() {
        let with = "| a | b |\n| --- | --- |\n| 1 | 2 |\n";
        assert!(segment(with).iter().any(|s| s.kind == ContentKind::Table));

        let without = "| a | b |\njust prose\n";
        assert!(!segment(without).iter().any(|s| s.kind == ContentKind::Table));
    }

    #[test]
    fn consecutive_list_lines_form_one_segment() {
        let text = "1. first\n2. second\n- third\n\nprose";
        let segments = segment(text);
        let lists: Vec<_> = segments
            .iter()
            .filter(|s| s.kind == ContentKind::List)
            .collect();
        assert_eq!(lists.len(), 1);
        assert!(lists[0].content.contains("third"));
    }

    #[test]
    fn headings_win_over_prose() {
        let text = "### Deep heading\nplain line\n";
        let segments = segment(text);
        assert_eq!(segments[0].kind, ContentKind::Heading);
        assert_eq!(segments[1].kind, ContentKind::Prose);
    }

    #[test]
    fn deterministic_output() {
        let text = "# h\ntext $a$ more\n```c\nint x;\n```\n";
        assert_eq!(segment(text), segment(text));
    }

    #[test]
    fn empty_input_yields_no_segments() {
        assert!(segment("").is_empty());
    }
}
