//! Section-aware text chunker with sliding-window overlap.
//!
//! Splits extracted document text into [`Chunk`]s bounded by
//! `max_chunk_chars`. Lengths and offsets are measured in UTF-8 bytes, which
//! equals characters for ASCII text; splits never fall inside a multi-byte
//! character.
//!
//! # Algorithm
//!
//! 1. Split the text into blocks on blank lines. A Markdown heading line
//!    (`#` to `######`) always opens a new block and becomes the section
//!    label of every chunk that follows it.
//! 2. Pack consecutive blocks of the same section into one chunk while the
//!    packed span fits in `max_chunk_chars`. The packed span is a verbatim
//!    slice of the document, blank lines included.
//! 3. A block longer than `max_chunk_chars` is cut with a sliding window of
//!    `max_chunk_chars`, stepping back `overlap_chars` each time. The
//!    window's right edge is pulled back to the last sentence or line break
//!    past the window's midpoint, else to the last word break past the
//!    midpoint, else left where it is.
//! 4. Chunks shorter than `min_chunk_chars` are dropped as noise, unless
//!    that would leave a non-blank document with nothing at all.
//!
//! Every chunk satisfies `text == document[start_offset..end_offset]`.
//!
//! # Example
//!
//! ```rust
//! use docent::chunk::Chunker;
//!
//! let chunker = Chunker::new(1000, 100).with_min_chunk_chars(1);
//! let chunks = chunker.split("doc-1", "# Refunds\n\nThe refund window is 30 days.");
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].section_label.as_deref(), Some("Refunds"));
//! ```

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate characters-per-token ratio used for `estimated_tokens`.
const CHARS_PER_TOKEN: usize = 4;

/// Chunks shorter than this are treated as noise by default.
pub const DEFAULT_MIN_CHUNK_CHARS: usize = 50;

/// Deterministic text splitter. Cheap to clone; holds only parameters.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_chunk_chars: usize,
    overlap_chars: usize,
    min_chunk_chars: usize,
}

/// A candidate chunk before ids and hashes are assigned.
#[derive(Debug, Clone)]
struct Span {
    start: usize,
    end: usize,
    label: Option<String>,
}

/// A run of non-blank lines.
struct Block {
    start: usize,
    end: usize,
    heading: Option<String>,
}

impl Chunker {
    pub fn new(max_chunk_chars: usize, overlap_chars: usize) -> Self {
        Self {
            max_chunk_chars: max_chunk_chars.max(1),
            overlap_chars,
            min_chunk_chars: DEFAULT_MIN_CHUNK_CHARS,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.max_chunk_chars, config.chunk_overlap_chars)
            .with_min_chunk_chars(config.min_chunk_chars)
    }

    pub fn with_min_chunk_chars(mut self, min_chunk_chars: usize) -> Self {
        self.min_chunk_chars = min_chunk_chars;
        self
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    /// Split `text` into unembedded chunks owned by `document_id`.
    ///
    /// Returns an empty vector for empty or whitespace-only text.
    pub fn split(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let spans = self.spans(text);

        let kept: Vec<&Span> = spans
            .iter()
            .filter(|s| s.end - s.start >= self.min_chunk_chars)
            .collect();
        let kept = if kept.is_empty() {
            spans.iter().collect()
        } else {
            kept
        };

        kept.into_iter()
            .enumerate()
            .map(|(i, span)| make_chunk(document_id, i as i64, text, span))
            .collect()
    }

    fn spans(&self, text: &str) -> Vec<Span> {
        let max = self.max_chunk_chars;
        let mut spans = Vec::new();
        let mut label: Option<String> = None;
        let mut group: Option<(usize, usize)> = None;

        for block in blocks(text) {
            if let Some(heading) = block.heading {
                flush(text, &mut group, &label, &mut spans);
                label = if heading.is_empty() { None } else { Some(heading) };
            }

            if block.end - block.start > max {
                flush(text, &mut group, &label, &mut spans);
                self.window(text, block.start, block.end, &label, &mut spans);
                continue;
            }

            group = match group {
                Some((start, _)) if block.end - start <= max => Some((start, block.end)),
                Some(_) => {
                    flush(text, &mut group, &label, &mut spans);
                    Some((block.start, block.end))
                }
                None => Some((block.start, block.end)),
            };
        }
        flush(text, &mut group, &label, &mut spans);

        spans
    }

    /// Cut `text[start..end]` with the overlapping sliding window.
    fn window(
        &self,
        text: &str,
        start: usize,
        end: usize,
        label: &Option<String>,
        out: &mut Vec<Span>,
    ) {
        let mut s = start;
        while s < end {
            let mut e = snap_to_char_boundary(text, (s + self.max_chunk_chars).min(end));
            if e <= s {
                // A single character wider than the window.
                e = next_char_boundary(text, s);
            }
            if e < end {
                e = pull_back(text, s, e);
            }

            push_trimmed(text, s, e, label, out);
            if e >= end {
                break;
            }

            let mut next = ceil_char_boundary(text, e.saturating_sub(self.overlap_chars).max(s + 1));
            if end - next < self.min_chunk_chars {
                // Widen the last window instead of leaving a noise-sized tail.
                let widened = end.saturating_sub(self.max_chunk_chars).max(s + 1);
                next = ceil_char_boundary(text, widened).min(next);
            }
            s = advance_to_word_start(text, next, e);
        }
    }
}

fn flush(text: &str, group: &mut Option<(usize, usize)>, label: &Option<String>, out: &mut Vec<Span>) {
    if let Some((start, end)) = group.take() {
        push_trimmed(text, start, end, label, out);
    }
}

fn push_trimmed(text: &str, start: usize, end: usize, label: &Option<String>, out: &mut Vec<Span>) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = slice.len() - slice.trim_start().len();
    out.push(Span {
        start: start + lead,
        end: start + lead + trimmed.len(),
        label: label.clone(),
    });
}

/// Split text into runs of non-blank lines; headings open their own run.
fn blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        let content_end = line_start + content.len();

        if content.trim().is_empty() {
            blocks.extend(current.take());
            continue;
        }

        if let Some(heading) = heading_text(content) {
            blocks.extend(current.take());
            current = Some(Block {
                start: line_start,
                end: content_end,
                heading: Some(heading),
            });
            continue;
        }

        match current.as_mut() {
            Some(block) => block.end = content_end,
            None => {
                current = Some(Block {
                    start: line_start,
                    end: content_end,
                    heading: None,
                })
            }
        }
    }
    blocks.extend(current);

    blocks
}

/// Returns the heading text if `line` is an ATX Markdown heading.
fn heading_text(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t')) {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim_end().to_string())
}

/// Move a window edge back to a sentence, line or word break past the midpoint.
fn pull_back(text: &str, start: usize, end: usize) -> usize {
    let bytes = text.as_bytes();
    let half = start + (end - start) / 2;

    // The edge may already sit on a sentence break.
    if matches!(bytes[end - 1], b'.' | b'!' | b'?') && bytes[end].is_ascii_whitespace() {
        return end;
    }

    for i in (half..end).rev() {
        match bytes[i] {
            b'\n' => return i + 1,
            b' ' | b'\t' if i > start && matches!(bytes[i - 1], b'.' | b'!' | b'?') => {
                return i + 1
            }
            _ => {}
        }
    }

    for i in (half..end).rev() {
        if bytes[i].is_ascii_whitespace() {
            return i + 1;
        }
    }

    end
}

/// Skip forward past a partial word, without reaching `limit`.
fn advance_to_word_start(text: &str, index: usize, limit: usize) -> usize {
    let bytes = text.as_bytes();
    if index == 0 || index >= limit || bytes[index - 1].is_ascii_whitespace() {
        return index;
    }
    match text[index..limit].find(|c: char| c.is_whitespace()) {
        Some(pos) => {
            let ws = index + pos;
            let after = ws + text[ws..].chars().next().map_or(1, char::len_utf8);
            if after < limit {
                after
            } else {
                index
            }
        }
        None => index,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map_or(s.len(), |c| index + c.len_utf8())
}

fn make_chunk(document_id: &str, index: i64, text: &str, span: &Span) -> Chunk {
    let body = &text[span.start..span.end];
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    let chars = body.chars().count();

    Chunk {
        id: format!("{}:{}", document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: body.to_string(),
        start_offset: span.start,
        end_offset: span.end,
        section_label: span.label.clone(),
        hash,
        estimated_tokens: chars.div_ceil(CHARS_PER_TOKEN),
        embedding: Vec::new(),
    }
}
