//! Content normalization between parsing and chunking.
//!
//! The [`Normalizer`] trait is a swappable strategy: callers can substitute
//! their own cleaning policy without touching the parser or chunker. The
//! default implementation strips markdown decoration and residual HTML tags,
//! collapses intra-line whitespace, and drops blocks that clean to nothing.

use crate::models::{ParsedDocument, SourceType};

/// Cleaning strategy applied to parsed blocks before chunking.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, doc: ParsedDocument, source_type: SourceType) -> ParsedDocument;
}

/// Default cleaning policy.
#[derive(Debug, Default)]
pub struct DefaultNormalizer;

impl Normalizer for DefaultNormalizer {
    fn normalize(&self, mut doc: ParsedDocument, source_type: SourceType) -> ParsedDocument {
        for block in &mut doc.blocks {
            let cleaned = match source_type {
                SourceType::Markdown => clean_markdown(&block.text),
                SourceType::Html | SourceType::Url => strip_residual_tags(&block.text),
                _ => block.text.clone(),
            };
            block.text = collapse_whitespace(&cleaned);
        }
        doc.blocks.retain(|b| !b.text.is_empty());
        doc
    }
}

/// Remove emphasis markers, list bullets, quote markers, and fence
/// delimiters. Fenced code content passes through verbatim.
fn clean_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        let mut stripped = trimmed;
        while let Some(rest) = stripped.strip_prefix('>') {
            stripped = rest.trim_start();
        }
        stripped = strip_bullet(stripped);
        let mut line_out = String::with_capacity(stripped.len());
        for c in stripped.chars() {
            if !matches!(c, '*' | '_' | '`') {
                line_out.push(c);
            }
        }
        out.push_str(&line_out);
        out.push('\n');
    }
    out
}

fn strip_bullet(line: &str) -> &str {
    for prefix in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest;
        }
    }
    line
}

fn strip_residual_tags(text: &str) -> String {
    if !text.contains('<') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Collapse runs of spaces/tabs within each line and trim line ends; keeps
/// line structure so the chunker still sees sentence boundaries.
pub fn collapse_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}
