//! End-to-end pipeline tests with in-memory collaborators.
//!
//! No network, no qdrant: the vector store, chunk repository, resolver, and
//! generation model are all swapped for in-process fakes. The offline
//! embedding provider is the real one, so the ingest→ask round trip
//! exercises the production embedding path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ragkit::config::{GenerationConfig, RagConfig};
use ragkit::embedding::{EmbeddingProvider, OfflineEmbeddings};
use ragkit::error::{codes, Error, Result};
use ragkit::generation::{GenerateOptions, Generation, LlmProvider};
use ragkit::ingest::{
    DocumentSource, IngestInput, IngestionPipeline, IngestionQueue, MemoryQueue, QueueConsumer,
};
use ragkit::models::{ChunkMeta, IngestionJob, KnowledgeBaseBinding, SourceType, Usage};
use ragkit::normalize::DefaultNormalizer;
use ragkit::pipeline::{RagPipeline, RagRequest, StaticResolver};
use ragkit::qdrant::{
    ChunkPayload, ChunkRepository, VectorFilter, VectorHit, VectorPoint, VectorStore, SCOPE_KB,
};

// ---- fakes ----

/// Returns a fixed hit list per knowledge base.
struct ScriptedStore {
    hits: HashMap<String, Vec<VectorHit>>,
}

#[async_trait]
impl VectorStore for ScriptedStore {
    async fn ensure_collection(&self, _name: &str, _dim: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert_points(&self, _collection: &str, _points: Vec<VectorPoint>) -> Result<()> {
        Ok(())
    }

    async fn search(
        &self,
        _collection: &str,
        _vector: &[f32],
        _top_k: usize,
        filter: &VectorFilter,
        _score_threshold: f32,
    ) -> Result<Vec<VectorHit>> {
        let kb = filter
            .conditions
            .iter()
            .find(|(k, _)| k == SCOPE_KB)
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        Ok(self.hits.get(&kb).cloned().unwrap_or_default())
    }
}

/// Records the score threshold each search was given.
#[derive(Default)]
struct ThresholdRecordingStore {
    thresholds: Mutex<Vec<f32>>,
}

#[async_trait]
impl VectorStore for ThresholdRecordingStore {
    async fn ensure_collection(&self, _name: &str, _dim: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert_points(&self, _collection: &str, _points: Vec<VectorPoint>) -> Result<()> {
        Ok(())
    }

    async fn search(
        &self,
        _collection: &str,
        _vector: &[f32],
        _top_k: usize,
        _filter: &VectorFilter,
        score_threshold: f32,
    ) -> Result<Vec<VectorHit>> {
        self.thresholds.lock().unwrap().push(score_threshold);
        Ok(vec![hit("c1", "d1", 0.1)])
    }
}

struct FailingStore;

#[async_trait]
impl VectorStore for FailingStore {
    async fn ensure_collection(&self, _name: &str, _dim: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert_points(&self, _collection: &str, _points: Vec<VectorPoint>) -> Result<()> {
        Ok(())
    }

    async fn search(
        &self,
        _collection: &str,
        _vector: &[f32],
        _top_k: usize,
        _filter: &VectorFilter,
        _score_threshold: f32,
    ) -> Result<Vec<VectorHit>> {
        Err(Error::upstream(codes::VECTOR_UPSTREAM, "vector store is down"))
    }
}

/// Stores points in memory and searches by cosine similarity.
#[derive(Default)]
struct InMemoryStore {
    points: Mutex<Vec<(String, VectorPoint)>>,
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn ensure_collection(&self, _name: &str, _dim: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut stored = self.points.lock().unwrap();
        for point in points {
            stored.retain(|(c, p)| !(c == collection && p.id == point.id));
            stored.push((collection.to_string(), point));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
        score_threshold: f32,
    ) -> Result<Vec<VectorHit>> {
        let stored = self.points.lock().unwrap();
        let mut hits: Vec<VectorHit> = stored
            .iter()
            .filter(|(c, p)| {
                c == collection
                    && filter.conditions.iter().all(|(key, value)| match key.as_str() {
                        "tenant_id" => &p.payload.tenant_id == value,
                        "kb_id" => &p.payload.kb_id == value,
                        _ => false,
                    })
            })
            .map(|(_, p)| VectorHit {
                id: p.id.clone(),
                score: cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .filter(|h| h.score >= score_threshold)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[async_trait]
impl ChunkRepository for InMemoryStore {
    async fn load_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkMeta>> {
        let stored = self.points.lock().unwrap();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| {
                stored.iter().find(|(_, p)| &p.id == id).map(|(_, p)| ChunkMeta {
                    document_id: p.payload.document_id.clone(),
                    chunk_id: p.id.clone(),
                    content: p.payload.content.clone(),
                    section: p.payload.section.clone(),
                    page_no: p.payload.page_no,
                })
            })
            .collect())
    }
}

struct MapRepo {
    metas: HashMap<String, ChunkMeta>,
}

#[async_trait]
impl ChunkRepository for MapRepo {
    async fn load_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkMeta>> {
        Ok(chunk_ids
            .iter()
            .filter_map(|id| self.metas.get(id).cloned())
            .collect())
    }
}

struct FakeLlm {
    reply: String,
    offline: bool,
}

#[async_trait]
impl LlmProvider for FakeLlm {
    fn name(&self) -> &str {
        "fake"
    }

    fn offline(&self) -> bool {
        self.offline
    }

    async fn generate(
        &self,
        _system: &str,
        _user: &str,
        _opts: GenerateOptions,
    ) -> Result<Generation> {
        Ok(Generation {
            text: self.reply.clone(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

struct BrokenEmbedder;

#[async_trait]
impl EmbeddingProvider for BrokenEmbedder {
    fn name(&self) -> &str {
        "broken"
    }

    fn dim(&self) -> usize {
        4
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![])
    }
}

// ---- helpers ----

fn hit(id: &str, doc: &str, score: f32) -> VectorHit {
    VectorHit {
        id: id.to_string(),
        score,
        payload: ChunkPayload {
            tenant_id: "t1".to_string(),
            kb_id: String::new(),
            document_id: doc.to_string(),
            document_version_id: format!("{doc}-v1"),
            content: format!("content of {id}"),
            ..ChunkPayload::default()
        },
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

fn bindings(kbs: &[&str]) -> Vec<KnowledgeBaseBinding> {
    kbs.iter()
        .map(|kb| KnowledgeBaseBinding {
            kb_id: kb.to_string(),
            weight: 1.0,
        })
        .collect()
}

fn rag_config() -> RagConfig {
    RagConfig {
        rerank_weight: 0.0,
        ..RagConfig::default()
    }
}

fn make_pipeline(
    kbs: &[&str],
    store: Arc<dyn VectorStore>,
    chunks: Arc<dyn ChunkRepository>,
    llm: Arc<dyn LlmProvider>,
    rag: RagConfig,
) -> RagPipeline {
    RagPipeline::new(
        Arc::new(StaticResolver {
            bindings: bindings(kbs),
        }),
        Arc::new(OfflineEmbeddings { dim: 32 }),
        store,
        chunks,
        llm,
        rag,
        GenerationConfig::default(),
        "test_chunks".to_string(),
    )
}

fn request(message: &str) -> RagRequest {
    RagRequest {
        tenant_id: "t1".to_string(),
        bot_id: "bot1".to_string(),
        message: message.to_string(),
    }
}

// ---- query pipeline ----

#[tokio::test]
async fn refuses_when_bot_has_no_knowledge_bases() {
    let pipeline = make_pipeline(
        &[],
        Arc::new(ScriptedStore {
            hits: HashMap::new(),
        }),
        Arc::new(MapRepo {
            metas: HashMap::new(),
        }),
        Arc::new(FakeLlm {
            reply: "should not be called".to_string(),
            offline: true,
        }),
        rag_config(),
    );
    let answer = pipeline.answer(request("anything")).await.unwrap();
    assert!(answer.refused);
    assert!(answer.references.is_empty());
    assert_eq!(answer.answer, GenerationConfig::default().refusal_message);
}

#[tokio::test]
async fn rejects_empty_bot_id_and_message() {
    let pipeline = make_pipeline(
        &["kb1"],
        Arc::new(ScriptedStore {
            hits: HashMap::new(),
        }),
        Arc::new(MapRepo {
            metas: HashMap::new(),
        }),
        Arc::new(FakeLlm {
            reply: String::new(),
            offline: true,
        }),
        rag_config(),
    );
    let mut req = request("hello");
    req.bot_id = "  ".to_string();
    assert_eq!(
        pipeline.answer(req).await.unwrap_err().code(),
        codes::BOT_ID_MISSING
    );
    let mut req = request("hello");
    req.message = String::new();
    assert_eq!(
        pipeline.answer(req).await.unwrap_err().code(),
        codes::MESSAGE_MISSING
    );
}

#[tokio::test]
async fn ranks_across_knowledge_bases_by_score() {
    let mut hits = HashMap::new();
    hits.insert(
        "kb1".to_string(),
        vec![hit("c1", "d1", 0.9), hit("c2", "d1", 0.85)],
    );
    hits.insert("kb2".to_string(), vec![hit("c3", "d2", 0.4)]);
    let metas: HashMap<String, ChunkMeta> = [
        meta("c1", "d1", "refunds are issued within thirty days"),
        meta("c2", "d1", "refunds require a receipt"),
        meta("c3", "d2", "shipping takes a week"),
    ]
    .into_iter()
    .map(|m| (m.chunk_id.clone(), m))
    .collect();

    let pipeline = make_pipeline(
        &["kb1", "kb2"],
        Arc::new(ScriptedStore { hits }),
        Arc::new(MapRepo { metas }),
        Arc::new(FakeLlm {
            reply: "Refunds are issued within thirty days.".to_string(),
            offline: true,
        }),
        rag_config(),
    );

    let answer = pipeline
        .answer(request("what is the refund policy"))
        .await
        .unwrap();
    assert!(!answer.refused);
    let order: Vec<&str> = answer
        .references
        .iter()
        .map(|r| r.chunk_id.as_str())
        .collect();
    assert_eq!(order, vec!["c1", "c2", "c3"]);
    assert_eq!(answer.references[0].rank, 1);
    assert!(answer.references[0].snippet.contains("thirty days"));

    // 0.8 * mean(0.9, 0.85, 0.4) + 0.2 * 3/5
    let want = 0.8 * ((0.9 + 0.85 + 0.4) / 3.0) + 0.2 * 0.6;
    assert!((answer.confidence - want).abs() < 1e-5, "got {}", answer.confidence);
}

#[tokio::test]
async fn refuses_when_confidence_below_threshold() {
    // One weak candidate: confidence = 0.8·0.1 + 0.2·(1/5) = 0.12, under
    // the default 0.2 threshold.
    let mut hits = HashMap::new();
    hits.insert("kb1".to_string(), vec![hit("c1", "d1", 0.1)]);
    let metas = [meta("c1", "d1", "barely related text")]
        .into_iter()
        .map(|m| (m.chunk_id.clone(), m))
        .collect();

    let pipeline = make_pipeline(
        &["kb1"],
        Arc::new(ScriptedStore { hits }),
        Arc::new(MapRepo { metas }),
        Arc::new(FakeLlm {
            reply: "should not be called".to_string(),
            offline: true,
        }),
        rag_config(),
    );
    let answer = pipeline.answer(request("what is the refund policy")).await.unwrap();
    assert!(answer.refused);
    assert!(answer.references.is_empty());
    assert_eq!(answer.answer, GenerationConfig::default().refusal_message);
    assert!((answer.confidence - 0.12).abs() < 1e-5, "got {}", answer.confidence);
}

#[tokio::test]
async fn retrieval_floor_is_softer_than_confidence_threshold() {
    // A candidate under the confidence threshold must still reach ranking;
    // the store only filters at min(threshold·0.2, 0.2).
    let store = Arc::new(ThresholdRecordingStore::default());
    let metas = [meta("c1", "d1", "barely related text")]
        .into_iter()
        .map(|m| (m.chunk_id.clone(), m))
        .collect();
    let pipeline = make_pipeline(
        &["kb1"],
        Arc::clone(&store) as Arc<dyn VectorStore>,
        Arc::new(MapRepo { metas }),
        Arc::new(FakeLlm {
            reply: String::new(),
            offline: true,
        }),
        rag_config(),
    );
    let answer = pipeline.answer(request("hello there")).await.unwrap();
    let thresholds = store.thresholds.lock().unwrap().clone();
    assert_eq!(thresholds.len(), 1);
    assert!((thresholds[0] - 0.04).abs() < 1e-6, "got {}", thresholds[0]);
    // The 0.1 hit was retrieved and assessed rather than dropped at search.
    assert!((answer.confidence - 0.12).abs() < 1e-5);
}

#[tokio::test]
async fn unhydratable_candidates_surface_not_found() {
    let mut hits = HashMap::new();
    hits.insert("kb1".to_string(), vec![hit("c1", "d1", 0.9)]);
    let pipeline = make_pipeline(
        &["kb1"],
        Arc::new(ScriptedStore { hits }),
        Arc::new(MapRepo {
            metas: HashMap::new(),
        }),
        Arc::new(FakeLlm {
            reply: String::new(),
            offline: true,
        }),
        rag_config(),
    );
    let err = pipeline.answer(request("hello there")).await.unwrap_err();
    assert_eq!(err.code(), codes::CHUNK_NOT_FOUND);
}

#[tokio::test]
async fn duplicate_chunks_across_kbs_are_deduplicated() {
    let mut hits = HashMap::new();
    hits.insert("kb1".to_string(), vec![hit("c1", "d1", 0.6)]);
    hits.insert("kb2".to_string(), vec![hit("c1", "d1", 0.9)]);
    let metas = [meta("c1", "d1", "shared chunk content")]
        .into_iter()
        .map(|m| (m.chunk_id.clone(), m))
        .collect();

    let pipeline = make_pipeline(
        &["kb1", "kb2"],
        Arc::new(ScriptedStore { hits }),
        Arc::new(MapRepo { metas }),
        Arc::new(FakeLlm {
            reply: "answer".to_string(),
            offline: true,
        }),
        rag_config(),
    );

    let answer = pipeline.answer(request("shared chunk")).await.unwrap();
    assert_eq!(answer.references.len(), 1);
    assert!((answer.references[0].score - 0.9).abs() < 1e-6);
}

#[tokio::test]
async fn embedding_count_mismatch_aborts() {
    let pipeline = RagPipeline::new(
        Arc::new(StaticResolver {
            bindings: bindings(&["kb1"]),
        }),
        Arc::new(BrokenEmbedder),
        Arc::new(ScriptedStore {
            hits: HashMap::new(),
        }),
        Arc::new(MapRepo {
            metas: HashMap::new(),
        }),
        Arc::new(FakeLlm {
            reply: String::new(),
            offline: true,
        }),
        rag_config(),
        GenerationConfig::default(),
        "test_chunks".to_string(),
    );
    let err = pipeline.answer(request("hello there")).await.unwrap_err();
    assert_eq!(err.code(), codes::EMBEDDING_COUNT_MISMATCH);
}

#[tokio::test]
async fn all_failed_branches_surface_first_error() {
    let pipeline = make_pipeline(
        &["kb1", "kb2"],
        Arc::new(FailingStore),
        Arc::new(MapRepo {
            metas: HashMap::new(),
        }),
        Arc::new(FakeLlm {
            reply: String::new(),
            offline: true,
        }),
        rag_config(),
    );
    let err = pipeline.answer(request("hello there")).await.unwrap_err();
    assert_eq!(err.code(), codes::VECTOR_UPSTREAM);
}

#[tokio::test]
async fn empty_reply_falls_back_to_refusal_message_with_references() {
    let mut hits = HashMap::new();
    hits.insert("kb1".to_string(), vec![hit("c1", "d1", 0.9)]);
    let metas = [meta("c1", "d1", "the only passage")]
        .into_iter()
        .map(|m| (m.chunk_id.clone(), m))
        .collect();

    let pipeline = make_pipeline(
        &["kb1"],
        Arc::new(ScriptedStore { hits }),
        Arc::new(MapRepo { metas }),
        Arc::new(FakeLlm {
            reply: "   ".to_string(),
            offline: true,
        }),
        rag_config(),
    );
    let answer = pipeline.answer(request("anything at all")).await.unwrap();
    assert!(!answer.refused);
    assert_eq!(answer.answer, GenerationConfig::default().refusal_message);
    assert_eq!(answer.references.len(), 1);
}

// ---- ingest → ask round trip ----

fn ingestion_pipeline(store: Arc<InMemoryStore>) -> IngestionPipeline {
    IngestionPipeline::new(
        Arc::new(DefaultNormalizer),
        Arc::new(OfflineEmbeddings { dim: 32 }),
        store,
        "test_chunks".to_string(),
        400,
        0,
        64,
    )
}

fn ingest_input(raw: &[u8]) -> IngestInput {
    IngestInput {
        tenant_id: "t1".to_string(),
        kb_id: "kb1".to_string(),
        document_id: "d1".to_string(),
        document_version_id: "v1".to_string(),
        source_type: SourceType::Text,
        raw: raw.to_vec(),
        title: String::new(),
        source_uri: "mem://d1".to_string(),
    }
}

#[tokio::test]
async fn ingest_then_ask_round_trip() {
    let store = Arc::new(InMemoryStore::default());
    let ingestion = ingestion_pipeline(Arc::clone(&store));
    let report = ingestion
        .ingest(&ingest_input(
            b"Section One\nHello world. This is a test.\n\nSection Two\nMore content here.",
        ))
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 2);
    assert_eq!(report.title, "Section One");

    let rag = RagConfig {
        rerank_weight: 0.0,
        score_threshold: 0.1,
        ..RagConfig::default()
    };
    let pipeline = make_pipeline(
        &["kb1"],
        Arc::clone(&store) as Arc<dyn VectorStore>,
        Arc::clone(&store) as Arc<dyn ChunkRepository>,
        Arc::new(FakeLlm {
            reply: "It is a test.".to_string(),
            offline: true,
        }),
        rag,
    );
    // Identical text embeds to an identical offline vector, cosine 1.0.
    let answer = pipeline
        .answer(request("Hello world. This is a test."))
        .await
        .unwrap();
    assert!(!answer.refused);
    assert_eq!(answer.answer, "It is a test.");
    assert_eq!(answer.references[0].document_id, "d1");
    assert!(answer.references[0].score > 0.9);
}

#[tokio::test]
async fn reingesting_same_version_does_not_duplicate() {
    let store = Arc::new(InMemoryStore::default());
    let ingestion = ingestion_pipeline(Arc::clone(&store));
    let input = ingest_input(b"Only one block of text lives here.");
    ingestion.ingest(&input).await.unwrap();
    ingestion.ingest(&input).await.unwrap();
    assert_eq!(store.points.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn broken_embedder_writes_nothing() {
    let store = Arc::new(InMemoryStore::default());
    let ingestion = IngestionPipeline::new(
        Arc::new(DefaultNormalizer),
        Arc::new(BrokenEmbedder),
        Arc::clone(&store) as Arc<dyn VectorStore>,
        "test_chunks".to_string(),
        400,
        0,
        64,
    );
    let err = ingestion
        .ingest(&ingest_input(b"Some content that will fail to embed."))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::EMBEDDING_COUNT_MISMATCH);
    assert!(store.points.lock().unwrap().is_empty());
}

// ---- queue consumer ----

struct StaticSource {
    input: IngestInput,
}

#[async_trait]
impl DocumentSource for StaticSource {
    async fn fetch(&self, _job: &IngestionJob) -> Result<IngestInput> {
        Ok(self.input.clone())
    }
}

struct FailingSource;

#[async_trait]
impl DocumentSource for FailingSource {
    async fn fetch(&self, _job: &IngestionJob) -> Result<IngestInput> {
        Err(Error::upstream(codes::QUEUE_UPSTREAM, "payload store unavailable"))
    }
}

fn job() -> IngestionJob {
    IngestionJob {
        tenant_id: "t1".to_string(),
        kb_id: "kb1".to_string(),
        document_id: "d1".to_string(),
        document_version_id: "v1".to_string(),
        attempt: 0,
    }
}

#[tokio::test]
async fn consumer_processes_enqueued_job() {
    let store = Arc::new(InMemoryStore::default());
    let queue = Arc::new(MemoryQueue::default());
    queue.enqueue(job()).await.unwrap();

    let consumer = QueueConsumer::new(
        Arc::clone(&queue) as Arc<dyn IngestionQueue>,
        Arc::new(StaticSource {
            input: ingest_input(b"A document delivered through the queue."),
        }),
        Arc::new(ingestion_pipeline(Arc::clone(&store))),
        3,
    );
    let processed = consumer.drain().await.unwrap();
    assert_eq!(processed, 1);
    assert!(!store.points.lock().unwrap().is_empty());
}

#[tokio::test]
async fn queued_ingestion_matches_inline_ingestion() {
    // The two paths the ingest command chooses between must index the same
    // points.
    let raw = b"Section One\nHello world. This is a test.\n\nSection Two\nMore content here.";
    let inline_store = Arc::new(InMemoryStore::default());
    ingestion_pipeline(Arc::clone(&inline_store))
        .ingest(&ingest_input(raw))
        .await
        .unwrap();

    let queued_store = Arc::new(InMemoryStore::default());
    let queue = Arc::new(MemoryQueue::default());
    queue.enqueue(job()).await.unwrap();
    let consumer = QueueConsumer::new(
        Arc::clone(&queue) as Arc<dyn IngestionQueue>,
        Arc::new(StaticSource {
            input: ingest_input(raw),
        }),
        Arc::new(ingestion_pipeline(Arc::clone(&queued_store))),
        3,
    );
    consumer.drain().await.unwrap();

    let ids = |store: &InMemoryStore| -> Vec<String> {
        let mut ids: Vec<String> = store
            .points
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.id.clone())
            .collect();
        ids.sort();
        ids
    };
    let inline_ids = ids(&inline_store);
    assert_eq!(inline_ids.len(), 2);
    assert_eq!(inline_ids, ids(&queued_store));
}

#[tokio::test]
async fn consumer_retries_then_dead_letters() {
    let store = Arc::new(InMemoryStore::default());
    let queue = Arc::new(MemoryQueue::default());
    queue.enqueue(job()).await.unwrap();

    let dead = Arc::new(Mutex::new(Vec::new()));
    let dead_clone = Arc::clone(&dead);
    let consumer = QueueConsumer::new(
        Arc::clone(&queue) as Arc<dyn IngestionQueue>,
        Arc::new(FailingSource),
        Arc::new(ingestion_pipeline(Arc::clone(&store))),
        3,
    )
    .with_dead_letter(Box::new(move |job| {
        dead_clone.lock().unwrap().push(job.document_id.clone());
    }));

    // Attempts 0 and 1 requeue, attempt 2 dead-letters.
    let processed = consumer.drain().await.unwrap();
    assert_eq!(processed, 3);
    assert_eq!(dead.lock().unwrap().as_slice(), ["d1".to_string()]);
    assert!(queue.next().await.unwrap().is_none());
}
