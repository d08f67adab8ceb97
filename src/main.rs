//! # ragkit CLI
//!
//! Two commands wired against qdrant and the configured providers:
//!
//! ```bash
//! ragkit ingest ./handbook.pdf --tenant acme --kb policies
//! ragkit ask "what is the refund policy" --tenant acme --bot support --kb policies
//! ```
//!
//! With no provider endpoints configured, the offline embedding and
//! generation fallbacks are used, so only qdrant needs to be reachable.
//! The document version ID is the SHA-256 of the file content, which makes
//! re-ingesting an unchanged file a no-op at the index level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use ragkit::config::{default_config, load_config, Config};
use ragkit::ingest::{
    DocumentSource, IngestInput, IngestionPipeline, IngestionQueue, MemoryQueue, QueueConsumer,
};
use ragkit::models::{IngestionJob, KnowledgeBaseBinding, SourceType};
use ragkit::normalize::DefaultNormalizer;
use ragkit::pipeline::{RagPipeline, RagRequest, StaticResolver};
use ragkit::qdrant::{QdrantChunkRepository, QdrantClient};
use ragkit::{embedding, generation};

/// Multi-tenant document ingestion and retrieval-augmented answering.
#[derive(Parser)]
#[command(name = "ragkit", version, about)]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse, chunk, embed, and index a document file.
    Ingest {
        /// File to ingest; source type is inferred from the extension.
        file: PathBuf,
        /// Tenant the document belongs to.
        #[arg(long)]
        tenant: String,
        /// Knowledge base to index into.
        #[arg(long)]
        kb: String,
        /// Document ID; derived from the file name when omitted.
        #[arg(long)]
        doc_id: Option<String>,
        /// Override the inferred source type (text, markdown, html, doc, docx, pdf).
        #[arg(long)]
        source_type: Option<String>,
        /// Document title; inferred from content when omitted.
        #[arg(long)]
        title: Option<String>,
    },
    /// Ask a question against one or more knowledge bases.
    Ask {
        /// The question.
        message: String,
        /// Tenant scope.
        #[arg(long)]
        tenant: String,
        /// Bot identity for the request.
        #[arg(long, default_value = "cli")]
        bot: String,
        /// Knowledge base(s) to search; repeatable.
        #[arg(long, required = true)]
        kb: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => default_config()?,
    };

    match cli.command {
        Command::Ingest {
            file,
            tenant,
            kb,
            doc_id,
            source_type,
            title,
        } => run_ingest(&config, file, tenant, kb, doc_id, source_type, title).await,
        Command::Ask {
            message,
            tenant,
            bot,
            kb,
        } => run_ask(&config, message, tenant, bot, kb).await,
    }
}

async fn run_ingest(
    config: &Config,
    file: PathBuf,
    tenant: String,
    kb: String,
    doc_id: Option<String>,
    source_type: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let raw = std::fs::read(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let source_type = match source_type {
        Some(name) => SourceType::from_name(&name),
        None => SourceType::from_path(&file),
    };
    let document_id = doc_id.unwrap_or_else(|| {
        file.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string()
    });
    let document_version_id = format!("{:x}", Sha256::digest(&raw));

    let embedder: Arc<dyn embedding::EmbeddingProvider> =
        embedding::new_provider(&config.embedding)?.into();
    let store = Arc::new(QdrantClient::new(&config.qdrant)?);
    let pipeline = IngestionPipeline::new(
        Arc::new(DefaultNormalizer),
        embedder,
        store,
        config.qdrant.collection.clone(),
        config.chunking.chunk_size,
        config.chunking.overlap,
        config.embedding.batch_size,
    );

    let input = IngestInput {
        tenant_id: tenant,
        kb_id: kb,
        document_id: document_id.clone(),
        document_version_id,
        source_type,
        source_uri: file.display().to_string(),
        title: title.unwrap_or_default(),
        raw,
    };

    if config.ingest.async_enabled {
        let queue: Arc<dyn IngestionQueue> = Arc::new(MemoryQueue::default());
        queue
            .enqueue(IngestionJob {
                tenant_id: input.tenant_id.clone(),
                kb_id: input.kb_id.clone(),
                document_id: input.document_id.clone(),
                document_version_id: input.document_version_id.clone(),
                attempt: 0,
            })
            .await?;
        let consumer = QueueConsumer::new(
            queue,
            Arc::new(InlineSource { input }),
            Arc::new(pipeline),
            config.ingest.max_retries,
        );
        let processed = consumer.drain().await?;
        println!("enqueued {document_id}: {processed} job(s) processed");
        return Ok(());
    }

    let report = pipeline.ingest(&input).await?;
    println!(
        "indexed {} as \"{}\": {} chunks, {} tokens",
        document_id, report.title, report.chunk_count, report.token_total
    );
    Ok(())
}

/// Serves the already-loaded file bytes to the queue consumer.
struct InlineSource {
    input: IngestInput,
}

#[async_trait]
impl DocumentSource for InlineSource {
    async fn fetch(&self, _job: &IngestionJob) -> ragkit::Result<IngestInput> {
        Ok(self.input.clone())
    }
}

async fn run_ask(
    config: &Config,
    message: String,
    tenant: String,
    bot: String,
    kbs: Vec<String>,
) -> Result<()> {
    let bindings = kbs
        .into_iter()
        .map(|kb_id| KnowledgeBaseBinding { kb_id, weight: 1.0 })
        .collect();
    let embedder: Arc<dyn embedding::EmbeddingProvider> =
        embedding::new_provider(&config.embedding)?.into();
    let llm: Arc<dyn generation::LlmProvider> =
        generation::new_provider(&config.generation)?.into();
    let store = Arc::new(QdrantClient::new(&config.qdrant)?);
    let chunks = Arc::new(QdrantChunkRepository::new(&config.qdrant)?);

    let pipeline = RagPipeline::new(
        Arc::new(StaticResolver { bindings }),
        embedder,
        store,
        chunks,
        llm,
        config.rag.clone(),
        config.generation.clone(),
        config.qdrant.collection.clone(),
    );

    let answer = pipeline
        .answer(RagRequest {
            tenant_id: tenant,
            bot_id: bot,
            message,
        })
        .await?;

    println!("{}", answer.answer);
    if !answer.references.is_empty() {
        println!();
        for reference in &answer.references {
            println!(
                "[{}] {} (chunk {}, score {:.3})",
                reference.rank, reference.document_id, reference.chunk_id, reference.score
            );
        }
    }
    eprintln!(
        "confidence: {:.3}{}",
        answer.confidence,
        if answer.refused { " (refused)" } else { "" }
    );
    Ok(())
}
