//! Structure-aware, token-budgeted chunking.
//!
//! Normalized blocks are packed greedily into chunks up to a token budget.
//! A page change, or a section change where both names are set, forces a
//! flush so a chunk never straddles a structural boundary. On budget
//! overflow the trailing `overlap` tokens of the flushed chunk seed the next
//! one, keeping context across the cut.
//!
//! Chunk IDs are UUIDv5 over `(document_version_id, chunk_index)`, so
//! re-chunking the same version always produces identical IDs — upserts to
//! the vector store are idempotent under at-least-once delivery.
//!
//! Token counting is deliberately approximate: a maximal run of Latin
//! letters/digits counts as one token, each CJK codepoint counts as one. It
//! only needs to be stable and monotonic for budgeting, not to match any
//! model's tokenizer.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{DocChunk, DocumentMeta, ParsedDocument};

pub const MIN_CHUNK_SIZE: usize = 64;
pub const MAX_CHUNK_SIZE: usize = 8192;

const SEGMENT_BOUNDARIES: [char; 8] = ['.', '!', '?', ';', '。', '！', '？', '；'];

/// Deterministic chunk ID for a `(document_version_id, chunk_index)` pair.
pub fn chunk_id(document_version_id: &str, chunk_index: u32) -> String {
    let name = format!("{document_version_id}:{chunk_index}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Byte ranges of the approximate tokens in `text`.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_ascii_alphanumeric() {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else {
            if let Some(s) = run_start.take() {
                spans.push((s, i));
            }
            if is_cjk(c) {
                spans.push((i, i + c.len_utf8()));
            }
        }
    }
    if let Some(s) = run_start {
        spans.push((s, text.len()));
    }
    spans
}

/// Approximate token count used for chunk budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    token_spans(text).len()
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF
    )
}

/// Script heuristic: `"zh"` when CJK dominates, `"en"` when Latin does,
/// empty when neither reaches ten codepoints.
pub fn detect_language(text: &str) -> String {
    let mut cjk = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else if c.is_ascii_alphanumeric() {
            latin += 1;
        }
    }
    if cjk >= 10 && cjk >= latin {
        "zh".to_string()
    } else if latin >= 10 && latin > cjk {
        "en".to_string()
    } else {
        String::new()
    }
}

/// Split block text into sentence-like segments. Boundary punctuation stays
/// attached to its segment; newlines are hard breaks.
fn split_segments(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut flush = |current: &mut String| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            segments.push(trimmed.to_string());
        }
        current.clear();
    };
    for c in text.chars() {
        if c == '\n' {
            flush(&mut current);
            continue;
        }
        current.push(c);
        if SEGMENT_BOUNDARIES.contains(&c) {
            flush(&mut current);
        }
    }
    flush(&mut current);
    segments
}

/// Hard-split an oversized segment at token-span boundaries so every piece
/// fits the budget.
fn hard_split(text: &str, max_tokens: usize) -> Vec<String> {
    let spans = token_spans(text);
    if spans.len() <= max_tokens {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut byte_start = 0usize;
    let mut i = 0usize;
    while i < spans.len() {
        let end_idx = (i + max_tokens).min(spans.len());
        let byte_end = if end_idx == spans.len() {
            text.len()
        } else {
            spans[end_idx].0
        };
        let piece = text[byte_start..byte_end].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        byte_start = byte_end;
        i = end_idx;
    }
    pieces
}

/// Chunk a normalized document into ordered, deterministically-identified
/// chunks. An empty block list yields zero chunks.
pub fn chunk_document(
    doc: &ParsedDocument,
    document_version_id: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<DocChunk> {
    let chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    let overlap = overlap.min(chunk_size - 1);

    let mut builder = Builder {
        version_id: document_version_id,
        meta: &doc.meta,
        chunk_size,
        overlap,
        chunks: Vec::new(),
        content: String::new(),
        tokens: 0,
        section: String::new(),
        page_no: 0,
    };

    let mut last_section = String::new();
    let mut last_page = 0u32;
    for (i, block) in doc.blocks.iter().enumerate() {
        if i > 0 && !builder.content.is_empty() {
            let page_changed = block.page_no != last_page;
            let section_changed = !block.section.is_empty()
                && !last_section.is_empty()
                && block.section != last_section;
            if page_changed || section_changed {
                builder.flush(0);
            }
        }
        last_section.clone_from(&block.section);
        last_page = block.page_no;

        if builder.content.is_empty() {
            builder.section.clone_from(&block.section);
            builder.page_no = block.page_no;
        }

        for segment in split_segments(&block.text) {
            let seg_tokens = estimate_tokens(&segment);
            if seg_tokens > chunk_size {
                if !builder.content.is_empty() {
                    builder.flush(0);
                }
                for piece in hard_split(&segment, chunk_size) {
                    let piece_tokens = estimate_tokens(&piece);
                    builder.pack(&piece, piece_tokens, &block.section, block.page_no);
                }
            } else {
                builder.pack(&segment, seg_tokens, &block.section, block.page_no);
            }
        }
    }
    if !builder.content.is_empty() {
        builder.flush(0);
    }
    builder.chunks
}

struct Builder<'a> {
    version_id: &'a str,
    meta: &'a DocumentMeta,
    chunk_size: usize,
    overlap: usize,
    chunks: Vec<DocChunk>,
    content: String,
    tokens: usize,
    section: String,
    page_no: u32,
}

impl Builder<'_> {
    fn pack(&mut self, segment: &str, seg_tokens: usize, section: &str, page_no: u32) {
        if self.tokens + seg_tokens > self.chunk_size && !self.content.is_empty() {
            self.flush(seg_tokens);
        }
        if self.content.is_empty() {
            self.section = section.to_string();
            self.page_no = page_no;
        } else {
            self.content.push(' ');
        }
        self.content.push_str(segment);
        self.tokens += seg_tokens;
    }

    /// Emit the in-progress chunk. When `next_tokens > 0` this is a budget
    /// flush and the overlap tail may seed the next chunk, provided the tail
    /// plus the incoming segment still fits.
    fn flush(&mut self, next_tokens: usize) {
        let content = self.content.trim().to_string();
        if content.is_empty() {
            self.content.clear();
            self.tokens = 0;
            return;
        }
        let index = self.chunks.len() as u32;
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let content_hash = format!("{:x}", hasher.finalize());

        self.chunks.push(DocChunk {
            id: chunk_id(self.version_id, index),
            chunk_index: index,
            token_count: estimate_tokens(&content),
            content_hash,
            language: detect_language(&content),
            section: self.section.clone(),
            page_no: self.page_no,
            source_uri: self.meta.source_uri.clone(),
            created_at: Utc::now(),
            content,
        });

        self.content.clear();
        self.tokens = 0;
        if self.overlap > 0 && next_tokens > 0 {
            let flushed = &self.chunks[self.chunks.len() - 1].content;
            let spans = token_spans(flushed);
            let take = self.overlap.min(spans.len());
            if take > 0 && take + next_tokens <= self.chunk_size {
                let tail_start = spans[spans.len() - take].0;
                self.content = flushed[tail_start..].to_string();
                self.tokens = take;
            }
        }
    }
}
