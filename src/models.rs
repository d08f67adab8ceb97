//! Core data models flowing through the ingestion and query pipelines.
//!
//! Parse-time types (`DocumentBlock`, `ParsedDocument`) are ephemeral and
//! discarded after chunking. `DocChunk` is the durable retrieval unit; its
//! ID is deterministic in `(document_version_id, chunk_index)` so
//! re-ingesting the same version is idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Declared or inferred format of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Text,
    Markdown,
    Html,
    Doc,
    Docx,
    Pdf,
    Url,
}

impl SourceType {
    /// Parse a declared source-type name. Unknown names fall back to `Text`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Self::Markdown,
            "html" | "htm" => Self::Html,
            "doc" => Self::Doc,
            "docx" => Self::Docx,
            "pdf" => Self::Pdf,
            "url" => Self::Url,
            _ => Self::Text,
        }
    }

    /// Infer a source type from a filename extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Self::Pdf,
            "doc" => Self::Doc,
            "docx" => Self::Docx,
            "md" | "markdown" => Self::Markdown,
            "html" | "htm" => Self::Html,
            _ => Self::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Doc => "doc",
            Self::Docx => "docx",
            Self::Pdf => "pdf",
            Self::Url => "url",
        }
    }
}

/// Per-document metadata, set once at parse time. Only the title is ever
/// filled in afterwards (when inferred from content).
#[derive(Debug, Clone, Default)]
pub struct DocumentMeta {
    pub title: String,
    pub source_uri: String,
    pub source_type: String,
}

/// Intermediate parse unit: a run of text with optional structural context.
#[derive(Debug, Clone, Default)]
pub struct DocumentBlock {
    pub text: String,
    pub section: String,
    pub page_no: u32,
}

/// Output of the parser, input to the normalizer and chunker.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub meta: DocumentMeta,
    pub blocks: Vec<DocumentBlock>,
}

/// A token-bounded passage of a document, the retrieval unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocChunk {
    pub id: String,
    pub chunk_index: u32,
    pub content: String,
    pub token_count: usize,
    pub content_hash: String,
    /// `"zh"`, `"en"`, or empty when neither script dominates.
    pub language: String,
    pub section: String,
    pub page_no: u32,
    pub source_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Transient pairing of a chunk and its embedding, between embed and upsert.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: DocChunk,
    pub vector: Vec<f32>,
}

/// One retrieval candidate, produced per (query, knowledge base) branch.
/// Deduplicated by `chunk_id` (keeping the max score) before ranking.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_version_id: String,
    pub kb_id: String,
    pub vector_score: f32,
    pub text_score: f32,
    pub fused_score: f32,
}

/// Hydrated content for a chunk that survived ranking.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub document_id: String,
    pub chunk_id: String,
    pub content: String,
    pub section: String,
    pub page_no: u32,
}

/// Citation surfaced to the caller alongside the generated answer.
#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub document_id: String,
    pub document_version_id: String,
    pub chunk_id: String,
    pub score: f32,
    pub rank: usize,
    pub snippet: String,
}

/// Token accounting reported by a generation provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A bot's binding to one knowledge base, with a retrieval weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseBinding {
    pub kb_id: String,
    #[serde(default = "default_kb_weight")]
    pub weight: f32,
}

fn default_kb_weight() -> f32 {
    1.0
}

/// Queue payload identifying a document version to (re)ingest.
///
/// Delivery is at-least-once; deterministic chunk IDs make redelivery safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub tenant_id: String,
    pub kb_id: String,
    pub document_id: String,
    pub document_version_id: String,
    #[serde(default)]
    pub attempt: u32,
}
