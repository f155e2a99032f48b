//! Cleanup of raw extracted page text before chunking.
//!
//! Rules, applied in order:
//!
//! 1. Join word-wrap hyphenation (`gradi-\nent` → `gradient`).
//! 2. Collapse each run of newlines into a single space.
//! 3. Collapse each run of whitespace into a single space.
//! 4. Trim leading and trailing whitespace.

use std::sync::LazyLock;

use regex::Regex;

static HYPHEN_WRAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\p{L}+)-\r?\n(\p{L}+)").expect("valid hyphenation pattern"));
static NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\r?\n)+").expect("valid newline pattern"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Normalize raw page text. Deterministic; empty input yields empty output.
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let joined = HYPHEN_WRAP.replace_all(raw, "$1$2");
    let spaced = NEWLINES.replace_all(&joined, " ");
    let collapsed = WHITESPACE.replace_all(&spaced, " ");
    collapsed.trim().to_string()
}
