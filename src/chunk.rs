//! Recursive separator-priority text chunker.
//!
//! Splits normalized page text into passages of at most `max_chars`
//! characters, preferring coarse boundaries: paragraph break, then line
//! break, then space, and only as a last resort arbitrary character offsets.
//! Consecutive chunks share up to `overlap_chars` characters of context.
//!
//! # Algorithm
//!
//! 1. Pick the first separator in [`SEPARATORS`] that occurs in the text
//!    (the empty separator always matches and means "split into characters").
//! 2. Split on it. Pieces that fit are buffered; a piece that is still too
//!    long flushes the buffer and is re-split with the remaining separators.
//! 3. Buffered pieces are greedily merged back into chunks joined by the
//!    separator. When a chunk is emitted, pieces are dropped from the front
//!    of the window until at most `overlap_chars` remain, and those carry
//!    over into the next chunk.
//!
//! Lengths are measured in characters, not bytes.
//!
//! Each [`Chunk`] gets a deterministic UUIDv5 derived from
//! `(task, document, page, ordinal)`, so re-indexing the same inputs yields
//! the same identifiers, plus a SHA-256 hash of its text.
//!
//! # Example
//!
//! ```rust
//! use passage_finder::chunk::chunk;
//!
//! assert!(chunk("", 500, 50).is_empty());
//! assert_eq!(chunk("  short text ", 500, 50), vec!["short text"]);
//! ```

use std::collections::VecDeque;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Separators in priority order; `""` means a hard character split.
pub const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Split cleaned text into ordered chunk strings.
///
/// - Empty (or whitespace-only) text yields no chunks.
/// - Text no longer than `max_chars` yields exactly one chunk, the trimmed text.
/// - Every chunk is non-empty and at most `max_chars` characters long.
pub fn chunk(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }
    let splitter = Splitter {
        max_chars,
        overlap_chars: overlap_chars.min(max_chars - 1),
    };
    splitter.split(text, &SEPARATORS)
}

/// Chunk one page of cleaned text into identified [`Chunk`]s.
///
/// Ordinals are contiguous from 0 within the page.
pub fn chunk_page(
    task_id: &str,
    document_name: &str,
    page_number: u32,
    cleaned_text: &str,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    chunk(cleaned_text, max_chars, overlap_chars)
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| {
            let ordinal = ordinal as u32;
            Chunk {
                id: chunk_id(task_id, document_name, page_number, ordinal),
                document_name: document_name.to_string(),
                page_number,
                ordinal,
                hash: hash_text(&text),
                text,
            }
        })
        .collect()
}

/// Deterministic chunk identifier for `(task, document, page, ordinal)`.
pub fn chunk_id(task_id: &str, document_name: &str, page_number: u32, ordinal: u32) -> String {
    let key = format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
        task_id, document_name, page_number, ordinal
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// SHA-256 of a chunk's text, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

struct Splitter {
    max_chars: usize,
    overlap_chars: usize,
}

impl Splitter {
    fn split(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (position, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, sep)| sep.is_empty() || text.contains(**sep))
            .map(|(i, sep)| (i, *sep))
            .unwrap_or((separators.len(), ""));
        let remaining = separators.get(position + 1..).unwrap_or(&[]);

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|p| !p.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();
        for piece in pieces {
            if char_len(piece) <= self.max_chars {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if remaining.is_empty() {
                chunks.extend(self.merge(&[piece], separator));
            } else {
                chunks.extend(self.split(piece, remaining));
            }
        }
        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }
        chunks
    }

    /// Greedily merge pieces that each fit into chunks of at most
    /// `max_chars`, carrying up to `overlap_chars` into the next chunk.
    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        // Length of the window joined by the separator.
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { sep_len };
            if total + joiner + len > self.max_chars && !window.is_empty() {
                push_joined(&mut chunks, &window, separator);
                while total > self.overlap_chars
                    || (total > 0 && total + sep_len + len > self.max_chars)
                {
                    let extra = if window.len() > 1 { sep_len } else { 0 };
                    match window.pop_front() {
                        Some((_, first_len)) => total -= first_len + extra,
                        None => break,
                    }
                }
            }
            let joiner = if window.is_empty() { 0 } else { sep_len };
            window.push_back((piece, len));
            total += len + joiner;
        }
        push_joined(&mut chunks, &window, separator);
        chunks
    }
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<(&str, usize)>, separator: &str) {
    let joined = window
        .iter()
        .map(|(piece, _)| *piece)
        .collect::<Vec<_>>()
        .join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}
