//! Overlapping recursive-boundary text chunker.
//!
//! Splits normalized document text into [`Chunk`]s of at most
//! `chunk_size` characters, where consecutive chunks share roughly
//! `chunk_overlap` characters so context carries across boundaries.
//!
//! Each chunk is an exact slice of the input: no trimming, no separator
//! removal. Dropping the overlapping prefix from every chunk but the first
//! and concatenating reproduces the input ([`merge_chunks`]).
//!
//! # Algorithm
//!
//! Lengths are measured in characters (Unicode scalar values), not bytes.
//!
//! 1. Empty or whitespace-only text yields no chunks.
//! 2. If the rest of the text fits in `chunk_size`, emit it and stop.
//! 3. Otherwise look at the next `chunk_size` characters and cut after the
//!    last paragraph break (`\n\n`), else the last line break (`\n`), else
//!    the last space. A boundary only counts if it leaves the chunk longer
//!    than `chunk_overlap`, so every step makes progress. With no usable
//!    boundary, cut hard at `chunk_size`.
//! 4. The next chunk starts `chunk_overlap` characters before the cut,
//!    moved forward to the next word start when one lies inside the overlap.
//!
//! # Example
//!
//! ```rust
//! use local_rag_core::chunk::{chunk_text, merge_chunks, ChunkParams};
//!
//! let text = "Hello world.\n\nSecond paragraph.";
//! let chunks = chunk_text("notes.md", text, &ChunkParams::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "notes.md_0");
//! assert_eq!(merge_chunks(&chunks), text);
//! ```

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Boundaries tried in order of preference.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Size limits for a chunking pass, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: 2500,
            chunk_overlap: 400,
        }
    }
}

/// Build the index-wide id of a chunk.
pub fn chunk_id(document_id: &str, chunk_index: i64) -> String {
    format!("{}_{}", document_id, chunk_index)
}

/// Split `text` into overlapping chunks.
///
/// # Guarantees
///
/// - Empty or whitespace-only text returns an empty vector.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - Every chunk holds at most `chunk_size` characters.
/// - `chunks[i + 1].char_start < chunks[i].char_end` whenever
///   `chunk_overlap > 0`, and the shared region is at most `chunk_overlap`.
///
/// `chunk_overlap` is clamped below `chunk_size`.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    split_spans(text, params)
        .into_iter()
        .enumerate()
        .map(|(i, (start, end, byte_start, byte_end))| {
            make_chunk(
                document_id,
                i as i64,
                &text[byte_start..byte_end],
                start,
                end,
            )
        })
        .collect()
}

/// Rebuild the original text from chunks produced by [`chunk_text`].
///
/// Chunks must be in `chunk_index` order.
pub fn merge_chunks(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut prev_end = 0usize;
    for (i, chunk) in chunks.iter().enumerate() {
        let skip = if i == 0 {
            0
        } else {
            prev_end.saturating_sub(chunk.char_start)
        };
        out.extend(chunk.text.chars().skip(skip));
        prev_end = chunk.char_end;
    }
    out
}

/// Compute `(char_start, char_end, byte_start, byte_end)` for each chunk.
fn split_spans(text: &str, params: &ChunkParams) -> Vec<(usize, usize, usize, usize)> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(size - 1);

    // offsets[c] is the byte position of char c; the last entry is text.len().
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = offsets.len() - 1;

    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        if total - start <= size {
            spans.push((start, total, offsets[start], offsets[total]));
            break;
        }

        let window_end = start + size;
        let min_end = start + overlap + 1;
        let end = find_split(text, &offsets, start, window_end, min_end);
        spans.push((start, end, offsets[start], offsets[end]));

        start = overlap_start(text, &offsets, start, end, overlap);
    }

    spans
}

/// Pick the cut point for a chunk starting at `start`.
fn find_split(
    text: &str,
    offsets: &[usize],
    start: usize,
    window_end: usize,
    min_end: usize,
) -> usize {
    let window = &text[offsets[start]..offsets[window_end]];
    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            let byte_end = offsets[start] + pos + sep.len();
            if let Ok(char_end) = offsets.binary_search(&byte_end) {
                if char_end >= min_end {
                    return char_end;
                }
            }
        }
    }
    window_end
}

/// Pick the start of the chunk following a cut at `end`.
fn overlap_start(
    text: &str,
    offsets: &[usize],
    start: usize,
    end: usize,
    overlap: usize,
) -> usize {
    if overlap == 0 {
        return end;
    }
    let candidate = end.saturating_sub(overlap).max(start + 1);
    let at_word_start = text[..offsets[candidate]]
        .chars()
        .next_back()
        .map(char::is_whitespace)
        .unwrap_or(true);
    if at_word_start {
        return candidate;
    }

    let region = &text[offsets[candidate]..offsets[end]];
    region
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
        .and_then(|(byte, c)| {
            let next_byte = offsets[candidate] + byte + c.len_utf8();
            offsets.binary_search(&next_byte).ok()
        })
        .filter(|&next| next < end)
        .unwrap_or(candidate)
}

/// Create a single [`Chunk`] with its deterministic id and SHA-256 content hash.
fn make_chunk(
    document_id: &str,
    index: i64,
    text: &str,
    char_start: usize,
    char_end: usize,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
        char_start,
        char_end,
    }
}
