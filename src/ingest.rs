//! Ingestion orchestration.
//!
//! The synchronous path runs parse → normalize → chunk → embed → upsert in
//! one call. The asynchronous path enqueues an [`IngestionJob`] and lets a
//! [`QueueConsumer`] replay the same synchronous path with ack/nack
//! semantics. Delivery is at-least-once; deterministic chunk IDs make the
//! upsert idempotent, so redelivery is harmless.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chunker::chunk_document;
use crate::embedding::{embed_batched, EmbeddingProvider};
use crate::error::{codes, Error, Result};
use crate::models::{EmbeddedChunk, IngestionJob, ParsedDocument, SourceType};
use crate::normalize::Normalizer;
use crate::parser::{fetch_and_parse_url, parse_document};
use crate::qdrant::{chunk_point, VectorStore};

/// Everything needed to ingest one document version.
#[derive(Debug, Clone)]
pub struct IngestInput {
    pub tenant_id: String,
    pub kb_id: String,
    pub document_id: String,
    pub document_version_id: String,
    pub source_type: SourceType,
    /// Raw bytes, or the URL itself for [`SourceType::Url`].
    pub raw: Vec<u8>,
    pub title: String,
    pub source_uri: String,
}

/// Outcome of one successful ingestion.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub chunk_count: usize,
    pub token_total: usize,
    pub title: String,
}

/// The synchronous ingestion flow and its dependencies.
pub struct IngestionPipeline {
    normalizer: Arc<dyn Normalizer>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    collection: String,
    chunk_size: usize,
    overlap: usize,
    batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(
        normalizer: Arc<dyn Normalizer>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        collection: String,
        chunk_size: usize,
        overlap: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            normalizer,
            embedder,
            store,
            collection,
            chunk_size,
            overlap,
            batch_size,
        }
    }

    /// Parse, normalize, chunk, embed, and upsert one document version.
    pub async fn ingest(&self, input: &IngestInput) -> Result<IngestReport> {
        let started = Instant::now();

        let parsed: ParsedDocument = if input.source_type == SourceType::Url {
            let url = String::from_utf8_lossy(&input.raw);
            fetch_and_parse_url(url.trim(), &input.title).await?
        } else {
            parse_document(&input.raw, input.source_type, &input.title, &input.source_uri)?
        };
        let normalized = self.normalizer.normalize(parsed, input.source_type);
        let chunks = chunk_document(
            &normalized,
            &input.document_version_id,
            self.chunk_size,
            self.overlap,
        );
        if chunks.is_empty() {
            info!(
                document_id = %input.document_id,
                "document produced no chunks, nothing to index"
            );
            return Ok(IngestReport {
                title: normalized.meta.title,
                ..IngestReport::default()
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &texts, self.batch_size).await?;

        self.store
            .ensure_collection(&self.collection, self.embedder.dim())
            .await?;
        let points: Vec<_> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                chunk_point(
                    &input.tenant_id,
                    &input.kb_id,
                    &input.document_id,
                    &input.document_version_id,
                    &EmbeddedChunk {
                        chunk: chunk.clone(),
                        vector,
                    },
                )
            })
            .collect();
        self.store.upsert_points(&self.collection, points).await?;

        let report = IngestReport {
            chunk_count: chunks.len(),
            token_total: chunks.iter().map(|c| c.token_count).sum(),
            title: normalized.meta.title,
        };
        info!(
            document_id = %input.document_id,
            version_id = %input.document_version_id,
            chunks = report.chunk_count,
            tokens = report.token_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document ingested"
        );
        Ok(report)
    }
}

// ---- job queue ----

/// Minimal queue contract: enqueue a job, pull the next one. Requeue on
/// failure is expressed as another enqueue with the attempt count bumped.
#[async_trait]
pub trait IngestionQueue: Send + Sync {
    async fn enqueue(&self, job: IngestionJob) -> Result<()>;
    async fn next(&self) -> Result<Option<IngestionJob>>;
}

/// In-process queue for tests and single-node deployments. A document
/// version acts as the idempotency key: submitting a version that is
/// already pending at the same attempt is rejected as a conflict, while
/// retry requeues (bumped attempt) pass through.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<IngestionJob>>,
}

#[async_trait]
impl IngestionQueue for MemoryQueue {
    async fn enqueue(&self, job: IngestionJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let duplicate = jobs.iter().any(|pending| {
            pending.document_version_id == job.document_version_id
                && pending.attempt == job.attempt
        });
        if duplicate {
            return Err(Error::conflict(
                codes::IDEMPOTENCY_CONFLICT,
                format!("version {} is already queued", job.document_version_id),
            ));
        }
        jobs.push_back(job);
        Ok(())
    }

    async fn next(&self) -> Result<Option<IngestionJob>> {
        Ok(self.jobs.lock().await.pop_front())
    }
}

/// Resolves a queued job reference into the full ingestion input.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, job: &IngestionJob) -> Result<IngestInput>;
}

/// Pulls jobs one at a time and replays the synchronous pipeline. A failed
/// job is re-enqueued with its attempt count bumped; once `max_retries` is
/// exhausted it goes to the dead-letter sink instead.
pub struct QueueConsumer {
    queue: Arc<dyn IngestionQueue>,
    source: Arc<dyn DocumentSource>,
    pipeline: Arc<IngestionPipeline>,
    max_retries: u32,
    retry_delay: Duration,
    dead_letter: Option<Box<dyn Fn(&IngestionJob) + Send + Sync>>,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn IngestionQueue>,
        source: Arc<dyn DocumentSource>,
        pipeline: Arc<IngestionPipeline>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            source,
            pipeline,
            max_retries,
            retry_delay: Duration::from_millis(100),
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(
        mut self,
        sink: Box<dyn Fn(&IngestionJob) + Send + Sync>,
    ) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Process at most one job. Returns false when the queue was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.next().await? else {
            return Ok(false);
        };
        debug!(
            document_id = %job.document_id,
            attempt = job.attempt,
            "consuming ingestion job"
        );
        let outcome = async {
            let input = self.source.fetch(&job).await?;
            self.pipeline.ingest(&input).await
        }
        .await;
        match outcome {
            Ok(_) => Ok(true),
            Err(err) => {
                if job.attempt + 1 >= self.max_retries {
                    error!(
                        document_id = %job.document_id,
                        attempt = job.attempt,
                        error = %err,
                        "ingestion job exhausted retries, dead-lettering"
                    );
                    if let Some(sink) = &self.dead_letter {
                        sink(&job);
                    }
                } else {
                    warn!(
                        document_id = %job.document_id,
                        attempt = job.attempt,
                        error = %err,
                        "ingestion job failed, requeueing"
                    );
                    tokio::time::sleep(self.retry_delay * (job.attempt + 1)).await;
                    let mut retry = job.clone();
                    retry.attempt += 1;
                    self.queue.enqueue(retry).await?;
                }
                Ok(true)
            }
        }
    }

    /// Drain the queue until it is empty.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }
}
