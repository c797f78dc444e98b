//! Post-processing: deterministic cleanup of raw LLM text.
//!
//! Even well-prompted models wrap JSON in fences, prepend a sentence of
//! commentary, or sprinkle zero-width characters through code. These rules
//! pull the structured part out of a response without touching its content.
//! Each is a pure `&str → String` function and independently testable.

use once_cell::sync::Lazy;
use regex::Regex;

/// Normalise a raw response before any extraction.
///
/// 1. CRLF / CR → LF
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim trailing whitespace per line
pub fn clean_response(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    trim_trailing_whitespace(&s)
}

// ── Line endings & whitespace ────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove invisible Unicode characters that break parsers and interpreters.
pub fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
            )
        })
        .collect()
}

// ── Fences ───────────────────────────────────────────────────────────────────

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\n(.*?)\n?```").unwrap());

/// Body of the first fenced block tagged with one of `langs`.
///
/// Falls back to the first untagged block. Returns `None` if neither exists.
pub fn extract_code_block(input: &str, langs: &[&str]) -> Option<String> {
    let mut untagged = None;
    for caps in RE_FENCED_BLOCK.captures_iter(input) {
        let tag = caps[1].to_lowercase();
        if langs.iter().any(|l| *l == tag) {
            return Some(caps[2].to_string());
        }
        if tag.is_empty() && untagged.is_none() {
            untagged = Some(caps[2].to_string());
        }
    }
    untagged
}

// ── JSON ─────────────────────────────────────────────────────────────────────

/// The JSON object in a response: a fenced `json` block if present, else the
/// span from the first `{` to the last `}`.
pub fn extract_json(input: &str) -> Option<String> {
    if let Some(block) = extract_code_block(input, &["json"]) {
        let block = block.trim();
        if block.starts_with('{') {
            return Some(block.to_string());
        }
    }
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| input[start..=end].to_string())
}

// ── Narration ────────────────────────────────────────────────────────────────

static RE_NARRATION_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?ims)^\s*(?:#+\s*)?\**narration\**\s*:\**\s*\n?(.+?)(?:\n\s*```|\z)").unwrap()
});

/// Narration text: a fenced `narration`/`text` block, or the text after a
/// `Narration:` label. Collapsed to single spaces.
pub fn extract_narration(input: &str) -> Option<String> {
    let raw = extract_tagged_block(input, &["narration", "text"]).or_else(|| {
        RE_NARRATION_LABEL
            .captures(input)
            .map(|caps| caps[1].to_string())
    })?;
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn extract_tagged_block(input: &str, langs: &[&str]) -> Option<String> {
    RE_FENCED_BLOCK.captures_iter(input).find_map(|caps| {
        let tag = caps[1].to_lowercase();
        langs
            .iter()
            .any(|l| *l == tag)
            .then(|| caps[2].to_string())
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────
