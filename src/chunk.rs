//! Sentence-boundary text chunker with overlap.
//!
//! Splits document body text into ordered windows that respect a
//! configurable `max_chars` limit. Each window prefers to end at a sentence
//! boundary (`.`, `!`, `?` followed by whitespace, or a newline) and falls
//! back to a hard character split only when no boundary exists inside the
//! window, bounding worst-case chunk count. Consecutive windows overlap by
//! a configured fraction so context survives the cut.
//!
//! Coverage invariant: window starts never jump past the previous window's
//! end, so concatenating each window's non-overlapping span reconstructs
//! the input exactly.
//!
//! Each chunk receives a fresh UUID plus a SHA-256 hash of its text for
//! staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::IngestionError;
use crate::models::Chunk;

/// A single window over the source text, with byte offsets into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextWindow<'a> {
    pub start: usize,
    pub end: usize,
    pub text: &'a str,
}

/// Lazy iterator of [`TextWindow`]s covering the full input without gaps.
///
/// Restartable: the iterator borrows the text, so calling [`windows`] again
/// yields an identical sequence.
pub struct ChunkWindows<'a> {
    text: &'a str,
    max_chars: usize,
    overlap_chars: usize,
    pos: usize,
    done: bool,
}

/// Iterate over `text` in windows of at most `max_chars` bytes, with
/// consecutive windows overlapping by `overlap` (a fraction in `[0, 1)`
/// of the window size).
pub fn windows(text: &str, max_chars: usize, overlap: f64) -> ChunkWindows<'_> {
    let max_chars = max_chars.max(1);
    let overlap_chars = ((max_chars as f64) * overlap.clamp(0.0, 0.9)) as usize;
    ChunkWindows {
        text,
        max_chars,
        overlap_chars,
        pos: 0,
        done: text.is_empty(),
    }
}

impl<'a> Iterator for ChunkWindows<'a> {
    type Item = TextWindow<'a>;

    fn next(&mut self) -> Option<TextWindow<'a>> {
        if self.done {
            return None;
        }

        let len = self.text.len();
        let end = if self.pos + self.max_chars >= len {
            len
        } else {
            let limit = floor_char_boundary(self.text, self.pos + self.max_chars);
            match last_sentence_boundary(&self.text[self.pos..limit]) {
                Some(rel) => self.pos + rel,
                // No safe split point inside the window: hard split.
                None => {
                    if limit > self.pos {
                        limit
                    } else {
                        ceil_char_boundary(self.text, self.pos + 1)
                    }
                }
            }
        };

        let window = TextWindow {
            start: self.pos,
            end,
            text: &self.text[self.pos..end],
        };

        if end >= len {
            self.done = true;
        } else {
            let mut next = ceil_char_boundary(self.text, end.saturating_sub(self.overlap_chars));
            if next <= self.pos {
                // Overlap would stall the walk; drop it for this step.
                next = end;
            }
            self.pos = next;
        }

        Some(window)
    }
}

/// Chunk a document body into ordered [`Chunk`]s.
///
/// Fails when the text is empty (or whitespace only) after extraction.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    max_chars: usize,
    overlap: f64,
) -> Result<Vec<Chunk>, IngestionError> {
    if text.trim().is_empty() {
        return Err(IngestionError::EmptyDocument);
    }

    Ok(windows(text, max_chars, overlap)
        .enumerate()
        .map(|(i, w)| make_chunk(document_id, i as i64, w.text))
        .collect())
}

fn make_chunk(document_id: &str, seq: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        seq,
        text: text.to_string(),
        hash,
    }
}

/// Byte offset just past the last sentence terminator in `slice`, if any.
///
/// A terminator is `.`, `!`, or `?` followed by whitespace (or at the end
/// of the slice), or a newline. All terminators are single ASCII bytes, so
/// the returned offset is always a char boundary.
fn last_sentence_boundary(slice: &str) -> Option<usize> {
    let bytes = slice.as_bytes();
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b'\n' => return Some(i + 1),
            b'.' | b'!' | b'?' => {
                if i + 1 == bytes.len() || bytes[i + 1].is_ascii_whitespace() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
