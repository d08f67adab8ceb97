//! The staged RAG query pipeline.
//!
//! One query flows through a fixed forward sequence:
//! init → resolve → embed → retrieve → load chunks → rerank → assess →
//! prompt → generate → respond. Any stage may decide to refuse, after which
//! the remaining generation-side stages are skipped and the configured
//! refusal message is returned with zero references.
//!
//! All pipeline state lives in an owned context passed through the stages;
//! nothing is shared across concurrent requests. The retrieval fan-out is
//! the only concurrent section and merges its results under a lock before
//! ranking starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{GenerationConfig, RagConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{codes, Error, Result};
use crate::generation::{GenerateOptions, LlmProvider};
use crate::models::{ChunkMeta, KnowledgeBaseBinding, Reference, ScoredChunk, Usage};
use crate::prompt::{build_answer_prompt, build_rerank_prompt, select_context, snippet};
use crate::qdrant::{ChunkRepository, VectorFilter, VectorStore};
use crate::scoring;

/// Hard cap on concurrent retrieval branches.
pub const MAX_RETRIEVE_CONCURRENCY: usize = 64;
/// Candidates offered to the cross-encoder re-rank.
const CROSS_ENCODER_TOP: usize = 8;
/// Clamp window for the cross-encoder call timeout.
const CROSS_ENCODER_MIN: Duration = Duration::from_millis(1200);
const CROSS_ENCODER_MAX: Duration = Duration::from_millis(2500);

/// Remaining-budget deadline passed explicitly through the stages.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// A stage timeout capped by the remaining overall budget.
    pub fn cap(&self, stage: Duration) -> Duration {
        stage.min(self.remaining())
    }
}

/// One incoming question scoped to a tenant's bot.
#[derive(Debug, Clone)]
pub struct RagRequest {
    pub tenant_id: String,
    pub bot_id: String,
    pub message: String,
}

/// The assembled answer returned to the caller.
#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub refused: bool,
    pub confidence: f32,
    pub references: Vec<Reference>,
    pub usage: Usage,
}

/// Loads the knowledge bases bound to a bot.
#[async_trait]
pub trait KnowledgeResolver: Send + Sync {
    async fn knowledge_bases(
        &self,
        tenant_id: &str,
        bot_id: &str,
    ) -> Result<Vec<KnowledgeBaseBinding>>;
}

/// Static bot→KB bindings, used by the CLI and tests.
pub struct StaticResolver {
    pub bindings: Vec<KnowledgeBaseBinding>,
}

#[async_trait]
impl KnowledgeResolver for StaticResolver {
    async fn knowledge_bases(
        &self,
        _tenant_id: &str,
        _bot_id: &str,
    ) -> Result<Vec<KnowledgeBaseBinding>> {
        Ok(self.bindings.clone())
    }
}

struct RagContext {
    request: RagRequest,
    queries: Vec<String>,
    query_weights: Vec<f32>,
    kbs: Vec<KnowledgeBaseBinding>,
    vectors: Vec<Vec<f32>>,
    candidates: Vec<ScoredChunk>,
    ranked: Vec<ScoredChunk>,
    metas: HashMap<String, ChunkMeta>,
    prompt: String,
    reply: String,
    usage: Usage,
    confidence: f32,
    refused: bool,
}

/// The query pipeline and its collaborators.
pub struct RagPipeline {
    resolver: Arc<dyn KnowledgeResolver>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    chunks: Arc<dyn ChunkRepository>,
    llm: Arc<dyn LlmProvider>,
    rag: RagConfig,
    generation: GenerationConfig,
    collection: String,
}

impl RagPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<dyn KnowledgeResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        chunks: Arc<dyn ChunkRepository>,
        llm: Arc<dyn LlmProvider>,
        rag: RagConfig,
        generation: GenerationConfig,
        collection: String,
    ) -> Self {
        Self {
            resolver,
            embedder,
            store,
            chunks,
            llm,
            rag,
            generation,
            collection,
        }
    }

    /// Answer one question end to end.
    pub async fn answer(&self, request: RagRequest) -> Result<RagAnswer> {
        let deadline = Deadline::new(Duration::from_millis(self.rag.timeout_ms));
        let mut ctx = self.init(request)?;

        self.resolve(&mut ctx).await?;
        if !ctx.refused {
            self.embed(&mut ctx, &deadline).await?;
            self.retrieve(&mut ctx, &deadline).await?;
        }
        if !ctx.refused {
            self.load_chunks(&mut ctx).await?;
            self.rerank(&mut ctx);
            self.assess(&mut ctx, &deadline).await;
        }
        if !ctx.refused {
            self.build_prompt(&mut ctx);
            self.generate(&mut ctx, &deadline).await?;
        }
        Ok(self.respond(ctx))
    }

    fn init(&self, request: RagRequest) -> Result<RagContext> {
        if request.bot_id.trim().is_empty() {
            return Err(Error::validation(codes::BOT_ID_MISSING, "bot id is required"));
        }
        if request.message.trim().is_empty() {
            return Err(Error::validation(codes::MESSAGE_MISSING, "message is required"));
        }
        let normalized = normalize_query(&request.message);
        // Expansion slots in here later; today there is one query, weight 1.
        let queries = vec![normalized];
        let query_weights = vec![1.0];
        Ok(RagContext {
            request,
            queries,
            query_weights,
            kbs: Vec::new(),
            vectors: Vec::new(),
            candidates: Vec::new(),
            ranked: Vec::new(),
            metas: HashMap::new(),
            prompt: String::new(),
            reply: String::new(),
            usage: Usage::default(),
            confidence: 0.0,
            refused: false,
        })
    }

    async fn resolve(&self, ctx: &mut RagContext) -> Result<()> {
        ctx.kbs = self
            .resolver
            .knowledge_bases(&ctx.request.tenant_id, &ctx.request.bot_id)
            .await?;
        if ctx.kbs.is_empty() {
            debug!(bot_id = %ctx.request.bot_id, "bot has no knowledge bases, refusing");
            ctx.refused = true;
        }
        Ok(())
    }

    async fn embed(&self, ctx: &mut RagContext, deadline: &Deadline) -> Result<()> {
        let started = Instant::now();
        let embed = self.embedder.embed(&ctx.queries);
        let vectors = tokio::time::timeout(deadline.remaining(), embed)
            .await
            .map_err(|_| {
                Error::upstream(codes::EMBEDDING_UPSTREAM, "query embedding timed out")
            })??;
        if vectors.len() != ctx.queries.len() {
            return Err(Error::upstream(
                codes::EMBEDDING_COUNT_MISMATCH,
                format!("got {} vectors for {} queries", vectors.len(), ctx.queries.len()),
            ));
        }
        ctx.vectors = vectors;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "query embedded");
        Ok(())
    }

    /// One concurrent search per (query vector × knowledge base), bounded
    /// by the configured concurrency. A single branch failure is tolerated;
    /// the first recorded error surfaces only when every branch failed and
    /// nothing was retrieved.
    async fn retrieve(&self, ctx: &mut RagContext, deadline: &Deadline) -> Result<()> {
        let started = Instant::now();
        let concurrency = ctx
            .vectors
            .len()
            .saturating_mul(ctx.kbs.len())
            .min(self.rag.retrieve_concurrency.max(1))
            .min(MAX_RETRIEVE_CONCURRENCY)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let accumulator: Arc<Mutex<Vec<ScoredChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let first_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let failures = Arc::new(AtomicUsize::new(0));
        let branch_timeout = deadline.cap(Duration::from_millis(self.rag.retrieve_timeout_ms));
        // The store gets a much softer floor than the answer confidence
        // threshold, so mid-score candidates still reach ranking.
        let retrieve_threshold = scoring::derive_retrieve_threshold(self.rag.score_threshold);

        let mut tasks = JoinSet::new();
        let mut branches = 0usize;
        for (vector, &query_weight) in ctx.vectors.iter().zip(&ctx.query_weights) {
            for kb in &ctx.kbs {
                branches += 1;
                let semaphore = Arc::clone(&semaphore);
                let accumulator = Arc::clone(&accumulator);
                let first_err = Arc::clone(&first_err);
                let failures = Arc::clone(&failures);
                let store = Arc::clone(&self.store);
                let collection = self.collection.clone();
                let vector = vector.clone();
                let tenant_id = ctx.request.tenant_id.clone();
                let kb = kb.clone();
                let top_k = self.rag.top_k;

                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let filter = VectorFilter::scoped(&tenant_id, &kb.kb_id);
                    let search =
                        store.search(&collection, &vector, top_k, &filter, retrieve_threshold);
                    let outcome = match tokio::time::timeout(branch_timeout, search).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::upstream(
                            codes::VECTOR_UPSTREAM,
                            format!("search against {} timed out", kb.kb_id),
                        )),
                    };
                    match outcome {
                        Ok(hits) => {
                            let mut scored: Vec<ScoredChunk> = hits
                                .into_iter()
                                .map(|hit| ScoredChunk {
                                    chunk_id: hit.id,
                                    document_id: hit.payload.document_id,
                                    document_version_id: hit.payload.document_version_id,
                                    kb_id: kb.kb_id.clone(),
                                    vector_score: hit.score * kb.weight * query_weight,
                                    text_score: 0.0,
                                    fused_score: 0.0,
                                })
                                .collect();
                            // Lock scoped to the append only.
                            if let Ok(mut acc) = accumulator.lock() {
                                acc.append(&mut scored);
                            }
                        }
                        Err(err) => {
                            warn!(kb_id = %kb.kb_id, error = %err, "knowledge base search failed");
                            failures.fetch_add(1, Ordering::Relaxed);
                            if let Ok(mut slot) = first_err.lock() {
                                slot.get_or_insert(err);
                            }
                        }
                    }
                });
            }
        }
        // Merge barrier: ranking must not start before every branch is done.
        while tasks.join_next().await.is_some() {}

        let candidates = match accumulator.lock() {
            Ok(mut acc) => std::mem::take(&mut *acc),
            Err(_) => Vec::new(),
        };
        let failed = failures.load(Ordering::Relaxed);
        if candidates.is_empty() && failed == branches && branches > 0 {
            let err = first_err
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .unwrap_or_else(|| {
                    Error::upstream(codes::VECTOR_UPSTREAM, "all retrieval branches failed")
                });
            return Err(err);
        }
        debug!(
            branches,
            failed,
            candidates = candidates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieval fan-out complete"
        );
        if candidates.is_empty() {
            ctx.refused = true;
        }
        ctx.candidates = candidates;
        Ok(())
    }

    /// Hydrate content for the deduplicated survivors only. A candidate
    /// missing its content is tolerated (it ranks on vector score alone),
    /// but nothing hydrating at all means the repository has lost the
    /// chunks the index still points at.
    async fn load_chunks(&self, ctx: &mut RagContext) -> Result<()> {
        ctx.candidates = scoring::dedup_candidates(std::mem::take(&mut ctx.candidates));
        let ids: Vec<String> = ctx.candidates.iter().map(|c| c.chunk_id.clone()).collect();
        let metas = self.chunks.load_chunks(&ids).await?;
        if metas.is_empty() && !ids.is_empty() {
            return Err(Error::not_found(
                codes::CHUNK_NOT_FOUND,
                format!("none of {} retrieved chunks could be loaded", ids.len()),
            ));
        }
        ctx.metas = metas.into_iter().map(|m| (m.chunk_id.clone(), m)).collect();
        Ok(())
    }

    fn rerank(&self, ctx: &mut RagContext) {
        let query = ctx.queries.first().map(String::as_str).unwrap_or_default();
        for candidate in &mut ctx.candidates {
            let (content, section) = match ctx.metas.get(&candidate.chunk_id) {
                Some(meta) => (meta.content.as_str(), meta.section.as_str()),
                None => ("", ""),
            };
            candidate.text_score = scoring::overlap_score(query, content, section);
            candidate.fused_score = scoring::fuse(
                candidate.vector_score,
                candidate.text_score,
                self.rag.rerank_weight,
            );
        }
        ctx.ranked = scoring::rank(std::mem::take(&mut ctx.candidates), self.rag.top_k);
    }

    /// Compute confidence, optionally escalate to the cross-encoder, then
    /// decide refuse-or-continue.
    async fn assess(&self, ctx: &mut RagContext, deadline: &Deadline) {
        ctx.confidence = scoring::confidence(&ctx.ranked, self.rag.top_k);
        if ctx.ranked.is_empty() {
            ctx.refused = true;
            return;
        }
        if ctx.confidence < self.rag.score_threshold
            && ctx.ranked.len() > 1
            && !self.llm.offline()
        {
            self.cross_encode(ctx, deadline).await;
            ctx.confidence = scoring::confidence(&ctx.ranked, self.rag.top_k);
        }
        if ctx.confidence < self.rag.score_threshold {
            debug!(
                confidence = ctx.confidence,
                threshold = self.rag.score_threshold,
                "confidence below threshold, refusing"
            );
            ctx.refused = true;
        }
    }

    /// Ask the generation model to reorder the top candidates. Failures and
    /// unparseable replies leave the score-based order untouched.
    async fn cross_encode(&self, ctx: &mut RagContext, deadline: &Deadline) {
        let head: Vec<ScoredChunk> =
            ctx.ranked.iter().take(CROSS_ENCODER_TOP).cloned().collect();
        let pairs: Vec<(&ScoredChunk, &ChunkMeta)> = head
            .iter()
            .filter_map(|c| ctx.metas.get(&c.chunk_id).map(|m| (c, m)))
            .collect();
        if pairs.len() < 2 {
            return;
        }
        let query = ctx.queries.first().map(String::as_str).unwrap_or_default();
        let prompt = build_rerank_prompt(query, &pairs);

        let base = Duration::from_millis(self.generation.timeout_ms / 5);
        let timeout = deadline.cap(base.clamp(CROSS_ENCODER_MIN, CROSS_ENCODER_MAX));
        let call = self.llm.generate(
            &self.generation.system_prompt,
            &prompt,
            GenerateOptions {
                temperature: 0.0,
                max_tokens: 256,
            },
        );
        let reply = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(generation)) => generation.text,
            Ok(Err(err)) => {
                warn!(error = %err, "cross-encoder call failed, keeping score order");
                return;
            }
            Err(_) => {
                warn!("cross-encoder call timed out, keeping score order");
                return;
            }
        };
        if let Some(order) = scoring::parse_rerank_order(&reply) {
            ctx.ranked = scoring::apply_rerank_order(std::mem::take(&mut ctx.ranked), &order);
            debug!("cross-encoder reordered candidates");
        }
    }

    fn build_prompt(&self, ctx: &mut RagContext) {
        let context = select_context(&ctx.ranked, &ctx.metas);
        let query = ctx.queries.first().map(String::as_str).unwrap_or_default();
        ctx.prompt = build_answer_prompt(query, &context);
    }

    async fn generate(&self, ctx: &mut RagContext, deadline: &Deadline) -> Result<()> {
        let started = Instant::now();
        let timeout = deadline.cap(Duration::from_millis(self.generation.timeout_ms));
        let call = self.llm.generate(
            &self.generation.system_prompt,
            &ctx.prompt,
            GenerateOptions {
                temperature: self.generation.temperature,
                max_tokens: self.generation.max_tokens,
            },
        );
        let generation = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::upstream(codes::GENERATION_UPSTREAM, "generation timed out"))??;
        ctx.reply = generation.text;
        ctx.usage = generation.usage;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "answer generated");
        Ok(())
    }

    fn respond(&self, ctx: RagContext) -> RagAnswer {
        if ctx.refused {
            return RagAnswer {
                answer: self.generation.refusal_message.clone(),
                refused: true,
                confidence: ctx.confidence,
                references: Vec::new(),
                usage: ctx.usage,
            };
        }
        let trimmed = ctx.reply.trim();
        let answer = if trimmed.is_empty() {
            self.generation.refusal_message.clone()
        } else {
            trimmed.to_string()
        };
        let references = ctx
            .ranked
            .iter()
            .enumerate()
            .map(|(i, chunk)| Reference {
                document_id: chunk.document_id.clone(),
                document_version_id: chunk.document_version_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                score: chunk.fused_score,
                rank: i + 1,
                snippet: ctx
                    .metas
                    .get(&chunk.chunk_id)
                    .map(|m| snippet(&m.content))
                    .unwrap_or_default(),
            })
            .collect();
        RagAnswer {
            answer,
            refused: false,
            confidence: ctx.confidence,
            references,
            usage: ctx.usage,
        }
    }
}

/// Trim and collapse whitespace; the lexical scorer lowercases on its own.
fn normalize_query(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}
