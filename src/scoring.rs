//! Score fusion, deduplication, ranking, and answer confidence.
//!
//! Pure functions over retrieval candidates. The fused score combines
//! vector similarity with a cheap lexical-overlap signal; confidence blends
//! the quality of the top ranks with how much of the requested top-K was
//! actually filled, and gates the refusal decision.

use std::collections::{HashMap, HashSet};

use crate::models::ScoredChunk;

/// Query token cap for the lexical overlap signal.
const MAX_QUERY_TOKENS: usize = 64;
/// Content token cap for the lexical overlap signal.
const MAX_CONTENT_TOKENS: usize = 256;
/// Multiplier applied to section-name overlap before the max against body.
const SECTION_BOOST: f32 = 1.2;

/// The score floor handed to the vector store. Much softer than the answer
/// confidence threshold, so mid-score candidates still reach ranking and
/// contribute to coverage: `min(threshold·0.2, 0.2)`, 0 disables the floor.
pub fn derive_retrieve_threshold(confidence_threshold: f32) -> f32 {
    if confidence_threshold <= 0.0 {
        return 0.0;
    }
    (confidence_threshold * 0.2).min(0.2)
}

/// `vector·(1−w) + text·w`, with the weight clamped to [0, 1].
pub fn fuse(vector_score: f32, text_score: f32, weight: f32) -> f32 {
    if weight <= 0.0 {
        return vector_score;
    }
    if weight >= 1.0 {
        return text_score;
    }
    vector_score * (1.0 - weight) + text_score * weight
}

/// Lowercased alphanumeric runs of length ≥ 2, capped at `max` tokens.
fn lexical_tokens(text: &str, max: usize) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            if current.chars().count() >= 2 {
                tokens.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            if tokens.len() >= max {
                return tokens;
            }
        }
    }
    if current.chars().count() >= 2 && tokens.len() < max {
        tokens.insert(current);
    }
    tokens
}

/// Fraction of query tokens found in the content; section-name overlap is
/// boosted and takes the max against the body overlap. A full section match
/// can push the score past 1.0 into fusion.
pub fn overlap_score(query: &str, content: &str, section: &str) -> f32 {
    let query_tokens = lexical_tokens(query, MAX_QUERY_TOKENS);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let body = fraction_overlap(&query_tokens, content, MAX_CONTENT_TOKENS);
    if section.is_empty() {
        return body;
    }
    let section_overlap =
        fraction_overlap(&query_tokens, section, MAX_CONTENT_TOKENS) * SECTION_BOOST;
    body.max(section_overlap)
}

fn fraction_overlap(query_tokens: &HashSet<String>, text: &str, cap: usize) -> f32 {
    let content_tokens = lexical_tokens(text, cap);
    let hits = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t))
        .count();
    hits as f32 / query_tokens.len() as f32
}

/// Keep, per chunk ID, only the highest-vector-score candidate across all
/// fan-out branches. First-seen order is preserved for survivors.
pub fn dedup_candidates(candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    let mut best: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<ScoredChunk> = Vec::new();
    for candidate in candidates {
        match best.get(&candidate.chunk_id) {
            Some(&i) if out[i].vector_score >= candidate.vector_score => {}
            Some(&i) => out[i] = candidate,
            None => {
                best.insert(candidate.chunk_id.clone(), out.len());
                out.push(candidate);
            }
        }
    }
    out
}

/// Sort descending by fused score and truncate to `top_k`.
pub fn rank(mut candidates: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(top_k);
    candidates
}

/// `0.8·mean(top ≤3 fused scores) + 0.2·min(1, ranked/topK)`, clamped to
/// [0, 1].
pub fn confidence(ranked: &[ScoredChunk], top_k: usize) -> f32 {
    if ranked.is_empty() || top_k == 0 {
        return 0.0;
    }
    let head = &ranked[..ranked.len().min(3)];
    let mean: f32 = head.iter().map(|c| c.fused_score).sum::<f32>() / head.len() as f32;
    let coverage = (ranked.len() as f32 / top_k as f32).min(1.0);
    (0.8 * mean + 0.2 * coverage).clamp(0.0, 1.0)
}

/// Extract a JSON array of chunk IDs from a cross-encoder reply. The model
/// may wrap the array in prose or code fences; anything between the first
/// `[` and the last `]` is tried.
pub fn parse_rerank_order(reply: &str) -> Option<Vec<String>> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    if end <= start {
        return None;
    }
    let ids: Vec<String> = serde_json::from_str(&reply[start..=end]).ok()?;
    if ids.is_empty() {
        return None;
    }
    Some(ids)
}

/// Reorder ranked chunks by the cross-encoder's ID list. IDs the model did
/// not mention keep their relative order and are appended after the
/// recognized ones.
pub fn apply_rerank_order(ranked: Vec<ScoredChunk>, order: &[String]) -> Vec<ScoredChunk> {
    let mut remaining: Vec<Option<ScoredChunk>> = ranked.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(remaining.len());
    for id in order {
        if let Some(slot) = remaining
            .iter_mut()
            .find(|c| c.as_ref().is_some_and(|c| &c.chunk_id == id))
        {
            if let Some(chunk) = slot.take() {
                out.push(chunk);
            }
        }
    }
    out.extend(remaining.into_iter().flatten());
    out
}
