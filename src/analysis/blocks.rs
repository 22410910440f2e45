//! Content-block extraction and the junk gate.
//!
//! [`extract_blocks`] pulls artifact-like structures out of whole messages:
//! fenced code, image-generation prompts, platform artifact/canvas wrappers,
//! embedded JSON, journal transcriptions, and the remaining prose when it is
//! long enough to be useful.
//!
//! [`is_junk`] is the single authoritative policy for "not worth embedding".
//! Both the indexer and this extractor call it; no other module carries its
//! own copy of these rules.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::model::{BlockKind, Role};

/// Minimum trimmed length for a fragment to be worth keeping or embedding.
pub const MIN_USEFUL_CHARS: usize = 30;

/// A semantic fragment extracted from one message, with provenance offsets
/// into the message text.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedBlock {
    pub kind: BlockKind,
    pub language: Option<String>,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub metadata: Value,
}

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\n(.*?)```").expect("fence regex")
});

static ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<antArtifact\b([^>]*)>(.*?)</antArtifact>").expect("artifact regex")
});

static PROMPT_STANZA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^prompt:\s*\S").expect("prompt stanza regex"));

static TOOL_CALL_PREFIXES: &[&str] = &[
    "search(",
    "open_url(",
    "click(",
    "mclick(",
    "back(",
    "{\"tool",
    "{\"command",
    "{\"async_task",
];

static IMAGE_PLACEHOLDER_PREFIXES: &[&str] = &["[Image", "[image", "[Attached image", "![image"];

/// The junk gate: `true` means the message is dropped before extraction and
/// never reaches the embedding backend.
pub fn is_junk(role: Role, text: &str) -> bool {
    if role == Role::Tool {
        return true;
    }
    let trimmed = text.trim();
    if trimmed.len() < MIN_USEFUL_CHARS {
        return true;
    }
    if TOOL_CALL_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return true;
    }
    if trimmed.contains("Traceback (most recent call last") {
        return true;
    }
    if trimmed.starts_with("Error fetching")
        || trimmed.starts_with("Failed to fetch")
        || trimmed.contains("fetch failed with status")
    {
        return true;
    }
    if IMAGE_PLACEHOLDER_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return true;
    }
    false
}

/// Extracts semantic blocks from one message.
///
/// `gizmo_id` is the provenance marker on the parent conversation; when it
/// names a known journal/notebook gizmo the whole message is treated as a
/// transcription and no further rules run.
pub fn extract_blocks(
    text: &str,
    gizmo_id: Option<&str>,
    journal_gizmos: &[String],
) -> Vec<ExtractedBlock> {
    if let Some(gizmo) = gizmo_id {
        if journal_gizmos.iter().any(|known| known == gizmo) {
            return vec![ExtractedBlock {
                kind: BlockKind::Transcription,
                language: None,
                content: text.trim().to_string(),
                start_offset: 0,
                end_offset: text.len(),
                metadata: serde_json::json!({ "gizmoId": gizmo }),
            }];
        }
    }

    let mut blocks: Vec<ExtractedBlock> = Vec::new();

    // Fenced code first; everything else works on the gaps between fences.
    for captures in FENCE.captures_iter(text) {
        let whole = captures.get(0).expect("fence match");
        let inner = captures.get(2).expect("fence body group");
        let tag = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let language = if tag.is_empty() {
            None
        } else {
            Some(tag.to_string())
        };
        let content = inner.as_str().trim_end().to_string();
        if content.is_empty() {
            continue;
        }
        // The claimed span covers the fences; the stored content is the
        // code itself.
        blocks.push(ExtractedBlock {
            kind: BlockKind::Code,
            language,
            content,
            start_offset: whole.start(),
            end_offset: whole.end(),
            metadata: serde_json::json!({}),
        });
    }

    for (gap_start, gap_end) in gaps(text.len(), &blocks) {
        extract_from_gap(text, gap_start, gap_end, &mut blocks);
    }

    blocks.sort_by_key(|block| block.start_offset);

    // Whatever no rule claimed becomes prose, when long enough to matter.
    for (gap_start, gap_end) in gaps(text.len(), &blocks) {
        let slice = &text[gap_start..gap_end];
        if slice.trim().len() >= MIN_USEFUL_CHARS {
            blocks.push(ExtractedBlock {
                kind: BlockKind::Prose,
                language: None,
                content: slice.trim().to_string(),
                start_offset: gap_start,
                end_offset: gap_end,
                metadata: serde_json::json!({}),
            });
        }
    }

    blocks.sort_by_key(|block| block.start_offset);
    blocks
}

/// Uncovered ranges between already-claimed blocks, in order.
fn gaps(len: usize, blocks: &[ExtractedBlock]) -> Vec<(usize, usize)> {
    let mut claimed: Vec<(usize, usize)> = blocks
        .iter()
        .map(|b| (b.start_offset, b.end_offset))
        .collect();
    claimed.sort_unstable();

    let mut result = Vec::new();
    let mut cursor = 0usize;
    for (start, end) in claimed {
        if start > cursor {
            result.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if cursor < len {
        result.push((cursor, len));
    }
    result
}

/// Runs the non-code rules over one uncovered range.
fn extract_from_gap(text: &str, gap_start: usize, gap_end: usize, blocks: &mut Vec<ExtractedBlock>) {
    let gap = &text[gap_start..gap_end];

    for captures in ARTIFACT.captures_iter(gap) {
        let whole = captures.get(0).expect("artifact match");
        let attrs = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let inner = captures.get(2).expect("artifact body group");
        blocks.push(ExtractedBlock {
            kind: BlockKind::Artifact,
            language: None,
            content: inner.as_str().trim().to_string(),
            start_offset: gap_start + whole.start(),
            end_offset: gap_start + whole.end(),
            metadata: serde_json::json!({ "attributes": attrs }),
        });
    }

    extract_json_blocks(text, gap_start, gap_end, blocks);

    for m in PROMPT_STANZA.find_iter(gap) {
        let start = gap_start + m.start();
        if blocks
            .iter()
            .any(|b| start >= b.start_offset && start < b.end_offset)
        {
            continue;
        }
        let rest = &text[start..gap_end];
        let extent = rest.find("\n\n").unwrap_or(rest.len());
        let content = rest[..extent].trim().to_string();
        blocks.push(ExtractedBlock {
            kind: BlockKind::ImagePrompt,
            language: None,
            content,
            start_offset: start,
            end_offset: start + extent,
            metadata: serde_json::json!({ "form": "stanza" }),
        });
    }
}

/// Finds embedded JSON values in a gap and classifies them.
///
/// Objects shaped like a canvas/textdoc payload (`name` + `type` +
/// `content`) become canvas blocks; objects carrying a `prompt` key become
/// image prompts; other objects and arrays become `json_data` when they are
/// substantial enough.
fn extract_json_blocks(
    text: &str,
    gap_start: usize,
    gap_end: usize,
    blocks: &mut Vec<ExtractedBlock>,
) {
    let gap = &text[gap_start..gap_end];
    let mut cursor = 0usize;

    while cursor < gap.len() {
        let Some(offset) = gap[cursor..].find(['{', '[']) else {
            break;
        };
        let candidate_start = cursor + offset;
        let absolute = gap_start + candidate_start;
        if blocks
            .iter()
            .any(|b| absolute >= b.start_offset && absolute < b.end_offset)
        {
            cursor = candidate_start + 1;
            continue;
        }
        let mut stream =
            serde_json::Deserializer::from_str(&gap[candidate_start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                let span = &gap[candidate_start..candidate_start + consumed];
                if let Some(block) =
                    classify_json(value, span, gap_start + candidate_start)
                {
                    blocks.push(block);
                }
                cursor = candidate_start + consumed.max(1);
            }
            _ => {
                cursor = candidate_start + 1;
            }
        }
    }
}

fn classify_json(value: Value, span: &str, start: usize) -> Option<ExtractedBlock> {
    let end = start + span.len();
    match &value {
        Value::Object(map) => {
            if map.contains_key("name") && map.contains_key("type") && map.contains_key("content") {
                return Some(ExtractedBlock {
                    kind: BlockKind::Canvas,
                    language: None,
                    content: span.to_string(),
                    start_offset: start,
                    end_offset: end,
                    metadata: serde_json::json!({
                        "name": map.get("name").cloned().unwrap_or(Value::Null),
                        "docType": map.get("type").cloned().unwrap_or(Value::Null),
                    }),
                });
            }
            if let Some(prompt) = map.get("prompt").and_then(Value::as_str) {
                return Some(ExtractedBlock {
                    kind: BlockKind::ImagePrompt,
                    language: None,
                    content: span.to_string(),
                    start_offset: start,
                    end_offset: end,
                    metadata: serde_json::json!({ "prompt": prompt, "form": "json" }),
                });
            }
            if span.len() >= MIN_USEFUL_CHARS {
                return Some(ExtractedBlock {
                    kind: BlockKind::JsonData,
                    language: None,
                    content: span.to_string(),
                    start_offset: start,
                    end_offset: end,
                    metadata: serde_json::json!({}),
                });
            }
            None
        }
        Value::Array(items) if !items.is_empty() && span.len() >= MIN_USEFUL_CHARS => {
            Some(ExtractedBlock {
                kind: BlockKind::JsonData,
                language: None,
                content: span.to_string(),
                start_offset: start,
                end_offset: end,
                metadata: serde_json::json!({}),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_gizmos() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn short_messages_are_junk() {
        assert!(is_junk(Role::User, "short text"));
        assert!(!is_junk(
            Role::User,
            "this message is comfortably longer than thirty characters"
        ));
    }

    #[test]
    fn tool_role_is_always_junk() {
        assert!(is_junk(
            Role::Tool,
            "even a long and otherwise interesting tool payload is junk here"
        ));
    }

    #[test]
    fn tracebacks_and_fetch_errors_are_junk() {
        assert!(is_junk(
            Role::Assistant,
            "Traceback (most recent call last):\n  File \"x.py\", line 1\nKeyError: 'a'"
        ));
        assert!(is_junk(
            Role::Assistant,
            "Error fetching https://example.com: connection refused after retry"
        ));
        assert!(is_junk(Role::User, "search(\"rust sqlite vector extension\")"));
        assert!(is_junk(Role::User, "[Image: a photograph of a mountain lake]"));
    }

    #[test]
    fn fenced_code_becomes_code_block() {
        let text = "Here is the function you asked about:\n\n```rust\nfn add(a: i32, b: i32) -> i32 { a + b }\n```\n\nIt adds two numbers together as expected.";
        let blocks = extract_blocks(text, None, &no_gizmos());
        let code = blocks.iter().find(|b| b.kind == BlockKind::Code).unwrap();
        assert_eq!(code.language.as_deref(), Some("rust"));
        assert!(code.content.starts_with("fn add"));
        assert!(text[code.start_offset..code.end_offset].contains("fn add"));

        let prose: Vec<_> = blocks.iter().filter(|b| b.kind == BlockKind::Prose).collect();
        assert_eq!(prose.len(), 2);
    }

    #[test]
    fn image_prompt_json_is_detected() {
        let text = r#"Generating now. {"prompt": "a watercolor fox in the snow", "size": "1024x1024"} Let me know how it looks once it renders."#;
        let blocks = extract_blocks(text, None, &no_gizmos());
        let prompt = blocks
            .iter()
            .find(|b| b.kind == BlockKind::ImagePrompt)
            .unwrap();
        assert_eq!(prompt.metadata["prompt"], "a watercolor fox in the snow");
    }

    #[test]
    fn prompt_stanza_is_detected() {
        let text = "prompt: a brutalist concrete library at golden hour\n\nI went with a wide-angle composition for this one.";
        let blocks = extract_blocks(text, None, &no_gizmos());
        assert_eq!(blocks[0].kind, BlockKind::ImagePrompt);
        assert!(blocks[0].content.contains("brutalist"));
    }

    #[test]
    fn artifact_wrapper_is_extracted() {
        let text = "Sure, here it is.\n<antArtifact identifier=\"notes\" type=\"text/markdown\">## Plan\nStep one, then step two.</antArtifact>\nAnything else I can help with today?";
        let blocks = extract_blocks(text, None, &no_gizmos());
        let artifact = blocks
            .iter()
            .find(|b| b.kind == BlockKind::Artifact)
            .unwrap();
        assert!(artifact.content.starts_with("## Plan"));
        assert!(artifact.metadata["attributes"]
            .as_str()
            .unwrap()
            .contains("identifier"));
    }

    #[test]
    fn canvas_payload_is_detected() {
        let text = r#"{"name": "essay-draft", "type": "document", "content": "Opening paragraph of the draft goes here."}"#;
        let blocks = extract_blocks(text, None, &no_gizmos());
        assert_eq!(blocks[0].kind, BlockKind::Canvas);
        assert_eq!(blocks[0].metadata["name"], "essay-draft");
    }

    #[test]
    fn embedded_json_array_is_json_data() {
        let text = r#"The export contained these rows: [{"id": 1, "label": "alpha"}, {"id": 2, "label": "beta"}] which we should keep."#;
        let blocks = extract_blocks(text, None, &no_gizmos());
        assert!(blocks.iter().any(|b| b.kind == BlockKind::JsonData));
    }

    #[test]
    fn journal_gizmo_short_circuits_to_transcription() {
        let gizmos = vec!["g-journal-123".to_string()];
        let text = "Dream from last night: I was walking through a library made of water.";
        let blocks = extract_blocks(text, Some("g-journal-123"), &gizmos);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Transcription);

        let other = extract_blocks(text, Some("g-other"), &gizmos);
        assert!(other.iter().all(|b| b.kind != BlockKind::Transcription));
    }

    #[test]
    fn short_remainder_is_dropped() {
        let text = "ok then\n\n```js\nconsole.log(1);\n```";
        let blocks = extract_blocks(text, None, &no_gizmos());
        assert!(blocks.iter().all(|b| b.kind != BlockKind::Prose));
    }

    #[test]
    fn classifier_is_deterministic() {
        let text = "Some prose that is long enough to count as useful.\n\n```py\nx=1\n```";
        assert_eq!(
            extract_blocks(text, None, &no_gizmos()),
            extract_blocks(text, None, &no_gizmos())
        );
    }
}
