//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s that respect a `max_tokens` budget,
//! preferring paragraph boundaries (`\n\n`), then newlines, then spaces.
//! Optional overlap carries the tail of the previous chunk forward.
//!
//! Chunk ids are UUID v5 of `source_id#index`, so rebuilding the same
//! corpus yields the same ids, and each chunk carries a SHA-256 of its text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks with contiguous indices starting at 0.
///
/// Empty or whitespace-only text yields no chunks.
pub fn chunk_text(source_id: &str, text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            pieces.extend(hard_split(trimmed, max_chars));
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    if overlap_chars > 0 {
        pieces = apply_overlap(pieces, overlap_chars);
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(source_id, i as i64, piece))
        .collect()
}

/// Split an oversized paragraph at newline or space boundaries.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let split_at = floor_char_boundary(remaining, max_chars.min(remaining.len()));
        let actual = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .filter(|&pos| pos > 0)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        // A single char wider than max_chars still has to make progress.
        let actual = if actual == 0 {
            remaining.chars().next().map(char::len_utf8).unwrap_or(remaining.len())
        } else {
            actual
        };
        let piece = remaining[..actual].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[actual..];
    }
    out
}

fn apply_overlap(pieces: Vec<String>, overlap_chars: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(pieces.len());
    let mut prev_tail: Option<String> = None;
    for piece in pieces {
        let tail = tail_at_word(&piece, overlap_chars);
        match prev_tail.take() {
            Some(t) if !t.is_empty() => out.push(format!("{} {}", t, piece)),
            _ => out.push(piece),
        }
        prev_tail = Some(tail);
    }
    out
}

fn tail_at_word(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let start = ceil_char_boundary(text, text.len() - max_chars);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start().to_string(),
        None => tail.to_string(),
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn make_chunk(source_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{}#{}", source_id, index).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        source_id: source_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 700, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_text("doc1", "", 700, 0).is_empty());
        assert!(chunk_text("doc1", "\n\n  \n\n", 700, 0).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_exceed_limit() {
        // max_tokens=5 => max_chars=20
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text("doc1", text, 5, 0);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_ids_are_stable_across_runs() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("notes/a.md", text, 2, 0);
        let c2 = chunk_text("notes/a.md", text, 2, 0);
        assert_eq!(c1, c2);

        let other = chunk_text("notes/b.md", text, 2, 0);
        assert_ne!(c1[0].id, other[0].id);
    }

    #[test]
    fn test_overlap_carries_previous_tail() {
        let text = "one two three four five\n\nsix seven eight nine ten";
        let chunks = chunk_text("doc", text, 6, 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("five") || chunks[1].text.contains("four five"));
        assert!(chunks[1].text.ends_with("ten"));
    }

    #[test]
    fn test_hard_split_respects_utf8() {
        let text = "é".repeat(50);
        let chunks = chunk_text("doc", &text, 3, 0);
        assert!(chunks.len() > 1);
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, text);
    }
}
