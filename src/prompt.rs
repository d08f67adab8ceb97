//! Prompt construction for the answer and cross-encoder calls.
//!
//! Context blocks are numbered and carry document/chunk/section/page
//! headers so the model can cite precisely. Selection dedups identical
//! content, caps blocks per document, and truncates each block; all
//! truncation is char-boundary safe.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::models::{ChunkMeta, ScoredChunk};

/// Character budget for one context block.
pub const BLOCK_CHAR_LIMIT: usize = 1200;
/// Maximum context blocks in one prompt.
pub const MAX_BLOCKS: usize = 12;
/// Maximum context blocks drawn from a single document.
pub const MAX_BLOCKS_PER_DOC: usize = 3;
/// Character budget for a reference snippet.
pub const SNIPPET_CHAR_LIMIT: usize = 200;

/// Truncate to at most `limit` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

/// The reference snippet for a hydrated chunk.
pub fn snippet(content: &str) -> String {
    truncate_chars(content.trim(), SNIPPET_CHAR_LIMIT).to_string()
}

/// Select the context blocks to include: ranked order, duplicate content
/// dropped, at most [`MAX_BLOCKS_PER_DOC`] per document, at most
/// [`MAX_BLOCKS`] total.
pub fn select_context<'a>(
    ranked: &'a [ScoredChunk],
    metas: &'a HashMap<String, ChunkMeta>,
) -> Vec<(&'a ScoredChunk, &'a ChunkMeta)> {
    let mut seen_fingerprints = HashSet::new();
    let mut per_doc: HashMap<&str, usize> = HashMap::new();
    let mut selected = Vec::new();
    for chunk in ranked {
        if selected.len() >= MAX_BLOCKS {
            break;
        }
        let Some(meta) = metas.get(&chunk.chunk_id) else {
            continue;
        };
        if meta.content.trim().is_empty() {
            continue;
        }
        let fingerprint = content_fingerprint(&meta.content);
        if !seen_fingerprints.insert(fingerprint) {
            continue;
        }
        let count = per_doc.entry(meta.document_id.as_str()).or_insert(0);
        if *count >= MAX_BLOCKS_PER_DOC {
            continue;
        }
        *count += 1;
        selected.push((chunk, meta));
    }
    selected
}

fn content_fingerprint(content: &str) -> [u8; 32] {
    let normalized: String = content
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    Sha256::digest(normalized.as_bytes()).into()
}

/// Build the grounded answer prompt: numbered context blocks followed by
/// the question.
pub fn build_answer_prompt(
    question: &str,
    context: &[(&ScoredChunk, &ChunkMeta)],
) -> String {
    let mut prompt = String::from("Context:\n");
    for (i, (chunk, meta)) in context.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] document: {} chunk: {}",
            i + 1,
            meta.document_id,
            chunk.chunk_id
        ));
        if !meta.section.is_empty() {
            prompt.push_str(&format!(" section: {}", meta.section));
        }
        if meta.page_no > 0 {
            prompt.push_str(&format!(" page: {}", meta.page_no));
        }
        prompt.push('\n');
        prompt.push_str(truncate_chars(meta.content.trim(), BLOCK_CHAR_LIMIT));
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("Question: {question}\nAnswer:"));
    prompt
}

/// Build the cross-encoder re-rank prompt over the top candidates. The
/// model is asked for a bare JSON array of chunk IDs in relevance order.
pub fn build_rerank_prompt(
    question: &str,
    candidates: &[(&ScoredChunk, &ChunkMeta)],
) -> String {
    let mut prompt = String::from(
        "Rank the following passages by relevance to the question. \
         Reply with only a JSON array of chunk ids, most relevant first.\n\n",
    );
    prompt.push_str(&format!("Question: {question}\n\n"));
    for (chunk, meta) in candidates {
        prompt.push_str(&format!(
            "chunk_id: {}\n{}\n\n",
            chunk.chunk_id,
            truncate_chars(meta.content.trim(), SNIPPET_CHAR_LIMIT)
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, doc: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            document_version_id: "v1".to_string(),
            kb_id: "kb1".to_string(),
            vector_score: 0.5,
            text_score: 0.0,
            fused_score: 0.5,
        }
    }

    fn meta(id: &str, doc: &str, content: &str) -> ChunkMeta {
        ChunkMeta {
            document_id: doc.to_string(),
            chunk_id: id.to_string(),
            content: content.to_string(),
            section: String::new(),
            page_no: 0,
        }
    }

    fn metas_of(list: Vec<ChunkMeta>) -> HashMap<String, ChunkMeta> {
        list.into_iter().map(|m| (m.chunk_id.clone(), m)).collect()
    }

    #[test]
    fn test_truncate_chars_multibyte_safe() {
        let text = "héllo wörld";
        assert_eq!(truncate_chars(text, 5), "héllo");
        assert_eq!(truncate_chars(text, 100), text);
    }

    #[test]
    fn test_select_dedups_identical_content() {
        let ranked = vec![chunk("c1", "d1"), chunk("c2", "d2")];
        let metas = metas_of(vec![
            meta("c1", "d1", "Same   Content here."),
            meta("c2", "d2", "same content HERE"),
        ]);
        let selected = select_context(&ranked, &metas);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.chunk_id, "c1");
    }

    #[test]
    fn test_select_caps_per_document() {
        let ranked: Vec<ScoredChunk> = (0..5).map(|i| chunk(&format!("c{i}"), "d1")).collect();
        let metas = metas_of(
            (0..5)
                .map(|i| meta(&format!("c{i}"), "d1", &format!("unique passage number {i}")))
                .collect(),
        );
        let selected = select_context(&ranked, &metas);
        assert_eq!(selected.len(), MAX_BLOCKS_PER_DOC);
    }

    #[test]
    fn test_select_skips_unhydrated() {
        let ranked = vec![chunk("c1", "d1"), chunk("c2", "d1")];
        let metas = metas_of(vec![meta("c2", "d1", "only this one is hydrated")]);
        let selected = select_context(&ranked, &metas);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.chunk_id, "c2");
    }

    #[test]
    fn test_answer_prompt_numbering_and_headers() {
        let ranked = vec![chunk("c1", "d1"), chunk("c2", "d2")];
        let mut m1 = meta("c1", "d1", "First passage.");
        m1.section = "Refunds".to_string();
        m1.page_no = 3;
        let metas = metas_of(vec![m1, meta("c2", "d2", "Second passage.")]);
        let context = select_context(&ranked, &metas);
        let prompt = build_answer_prompt("what is the policy?", &context);
        assert!(prompt.contains("[1] document: d1 chunk: c1 section: Refunds page: 3"));
        assert!(prompt.contains("[2] document: d2 chunk: c2"));
        assert!(prompt.ends_with("Question: what is the policy?\nAnswer:"));
    }

    #[test]
    fn test_answer_prompt_truncates_blocks() {
        let ranked = vec![chunk("c1", "d1")];
        let long = "x".repeat(BLOCK_CHAR_LIMIT * 2);
        let metas = metas_of(vec![meta("c1", "d1", &long)]);
        let context = select_context(&ranked, &metas);
        let prompt = build_answer_prompt("q", &context);
        assert!(prompt.len() < BLOCK_CHAR_LIMIT + 200);
    }

    #[test]
    fn test_rerank_prompt_lists_ids() {
        let ranked = vec![chunk("c1", "d1"), chunk("c2", "d1")];
        let metas = metas_of(vec![
            meta("c1", "d1", "first passage"),
            meta("c2", "d1", "second passage"),
        ]);
        let context = select_context(&ranked, &metas);
        let prompt = build_rerank_prompt("q", &context);
        assert!(prompt.contains("chunk_id: c1"));
        assert!(prompt.contains("chunk_id: c2"));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn test_snippet_limit() {
        let s = snippet(&"a".repeat(500));
        assert_eq!(s.chars().count(), SNIPPET_CHAR_LIMIT);
    }
}
