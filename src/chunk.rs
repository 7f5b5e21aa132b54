//! Overlapping fixed-size text chunker.
//!
//! Splits document body text into [`Chunk`]s of at most `max_chars`
//! characters, with consecutive windows overlapping by `overlap_chars`.
//! Window breaks back off to the last whitespace inside the window when
//! one exists, so words are rarely split.
//!
//! Chunking is deterministic for identical input and configuration: the
//! same text always yields the same chunk ids, texts, and hashes. This is
//! what keeps cache fingerprints stable and reingestion idempotent.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Split text into overlapping chunks with contiguous ordinals from 0.
///
/// Empty or whitespace-only text yields no chunks; text shorter than one
/// window yields exactly one.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    let n = chars.len();

    if n <= max_chars {
        return vec![make_chunk(document_id, 0, trimmed)];
    }

    let mut chunks = Vec::new();
    let mut ordinal: i64 = 0;
    let mut start = 0usize;

    loop {
        let end = (start + max_chars).min(n);

        // Back off to the last whitespace inside a non-final window.
        let brk = if end < n {
            match chars[start + 1..end].iter().rposition(|c| c.is_whitespace()) {
                Some(pos) => start + 1 + pos + 1,
                None => end,
            }
        } else {
            end
        };

        let piece: String = chars[start..brk].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(document_id, ordinal, piece));
            ordinal += 1;
        }

        if brk >= n {
            break;
        }

        // Overlap is bounded below so the window always advances.
        let next = brk.saturating_sub(overlap_chars);
        start = if next > start { next } else { start + 1 };
    }

    chunks
}

fn make_chunk(document_id: &str, ordinal: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: format!("{}:{}", document_id, ordinal),
        document_id: document_id.to_string(),
        ordinal,
        text: text.to_string(),
        hash,
    }
}
