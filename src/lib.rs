//! # ragkit
//!
//! Multi-tenant document ingestion and retrieval-augmented answering.
//!
//! ragkit turns heterogeneous documents (text, markdown, html, doc, docx,
//! pdf, fetched URLs) into embedding-indexed chunks in a qdrant collection,
//! and answers natural-language questions against them: multi-knowledge-base
//! concurrent retrieval, score fusion, an optional LLM cross-encoder
//! re-rank, and a confidence-gated refusal when the evidence is thin.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐  ┌───────────┐  ┌─────────┐  ┌───────────┐  ┌────────┐
//! │ Parser │─▶│ Normalizer │─▶│ Chunker │─▶│ Embeddings │─▶│ qdrant │
//! └────────┘  └───────────┘  └─────────┘  └───────────┘  └───┬────┘
//!                                                            │
//!             ┌──────────────────────────────────────────────┘
//!             ▼
//!        ┌──────────┐  ┌─────────┐  ┌────────┐  ┌──────────┐
//!        │ Retrieve │─▶│ Rerank  │─▶│ Prompt │─▶│ Generate │
//!        └──────────┘  └─────────┘  └────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with env overrides |
//! | [`error`] | Error taxonomy with stable codes |
//! | [`models`] | Core data types |
//! | [`parser`] | Format-specific document parsing |
//! | [`normalize`] | Swappable content normalization |
//! | [`chunker`] | Structure-aware token-budgeted chunking |
//! | [`embedding`] | Embedding provider registry |
//! | [`generation`] | Generation provider registry |
//! | [`qdrant`] | Vector store adapter and chunk hydration |
//! | [`scoring`] | Score fusion, ranking, confidence |
//! | [`prompt`] | Context selection and prompt assembly |
//! | [`ingest`] | Ingestion orchestration and job queue |
//! | [`pipeline`] | The staged RAG query pipeline |

pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod qdrant;
pub mod scoring;

pub use error::{Error, Result};
