//! Vector store adapter speaking the qdrant HTTP protocol.
//!
//! The [`VectorStore`] trait covers collection lifecycle, point upsert, and
//! filtered similarity search; [`ChunkRepository`] hydrates chunk content
//! for ranked survivors. [`QdrantClient`] implements both against a qdrant
//! server, storing chunk content and structure in point payloads so the
//! full answer path needs no other storage.
//!
//! Every search filter must carry tenant and knowledge-base scoping; a
//! missing scope is a programming error, not a recoverable condition.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::QdrantConfig;
use crate::error::{codes, Error, Result};
use crate::models::{ChunkMeta, EmbeddedChunk};

pub const SCOPE_TENANT: &str = "tenant_id";
pub const SCOPE_KB: &str = "kb_id";

/// One point as sent to / read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// Payload stored with every chunk point. Carries enough to scope searches,
/// build references, and hydrate content without a separate chunk store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub tenant_id: String,
    pub kb_id: String,
    pub document_id: String,
    pub document_version_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub section: String,
    pub page_no: u32,
    pub source_uri: String,
    pub language: String,
    pub content_hash: String,
}

/// Conjunctive equality filter over payload keys.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub conditions: Vec<(String, String)>,
}

impl VectorFilter {
    /// The mandatory tenant + knowledge-base scope.
    pub fn scoped(tenant_id: &str, kb_id: &str) -> Self {
        Self {
            conditions: vec![
                (SCOPE_TENANT.to_string(), tenant_id.to_string()),
                (SCOPE_KB.to_string(), kb_id.to_string()),
            ],
        }
    }

    fn has_scope(&self) -> bool {
        let keys: Vec<&str> = self.conditions.iter().map(|(k, _)| k.as_str()).collect();
        keys.contains(&SCOPE_TENANT) && keys.contains(&SCOPE_KB)
    }
}

/// A search candidate: point ID, similarity score, and payload.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Point-based vector database operations used by both pipelines.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent; succeeds when it already exists.
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;
    /// Upsert points; a no-op on empty input.
    async fn upsert_points(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;
    /// Filtered similarity search, score-sorted by the store.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
        score_threshold: f32,
    ) -> Result<Vec<VectorHit>>;
}

/// Lazy hydration of chunk content for ranked survivors only.
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    async fn load_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkMeta>>;
}

// ---- wire types ----

#[derive(Serialize)]
struct CreateCollectionBody {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Serialize)]
struct UpsertBody {
    points: Vec<WirePoint>,
}

#[derive(Serialize)]
struct WirePoint {
    id: String,
    vector: Vec<f32>,
    payload: ChunkPayload,
}

#[derive(Serialize)]
struct SearchBody {
    vector: Vec<f32>,
    limit: usize,
    with_payload: bool,
    filter: WireFilter,
    score_threshold: f32,
}

#[derive(Serialize)]
struct WireFilter {
    must: Vec<WireCondition>,
}

#[derive(Serialize)]
struct WireCondition {
    key: String,
    #[serde(rename = "match")]
    matches: WireMatch,
}

#[derive(Serialize)]
struct WireMatch {
    value: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: Option<ChunkPayload>,
}

#[derive(Serialize)]
struct RetrieveBody {
    ids: Vec<String>,
    with_payload: bool,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    result: Vec<RetrievedPoint>,
}

#[derive(Deserialize)]
struct RetrievedPoint {
    id: serde_json::Value,
    #[serde(default)]
    payload: Option<ChunkPayload>,
}

fn point_id_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---- client ----

/// HTTP client for a qdrant server.
pub struct QdrantClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl QdrantClient {
    pub fn new(config: &QdrantConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(Error::config(
                codes::CONFIG_INVALID,
                "qdrant.endpoint must not be empty",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::upstream(codes::VECTOR_UPSTREAM, e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path));
        if !self.api_key.is_empty() {
            req = req.header("api-key", &self.api_key);
        }
        req
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::upstream(
            codes::VECTOR_UPSTREAM,
            format!("{what} returned {status}: {body}"),
        ))
    }

    /// Retrieve points by ID with payloads.
    pub async fn retrieve_points(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<VectorHit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = RetrieveBody {
            ids: ids.to_vec(),
            with_payload: true,
        };
        let resp = self
            .request(reqwest::Method::POST, &format!("/collections/{collection}/points"))
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp, "point retrieve").await?;
        let parsed: RetrieveResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(codes::VECTOR_UPSTREAM, e.to_string()))?;
        Ok(parsed
            .result
            .into_iter()
            .map(|p| VectorHit {
                id: point_id_string(&p.id),
                score: 0.0,
                payload: p.payload.unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl VectorStore for QdrantClient {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/collections/{name}"))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(
                codes::VECTOR_UPSTREAM,
                format!("collection check returned {status}: {body}"),
            ));
        }
        let body = CreateCollectionBody {
            vectors: VectorParams {
                size: dim,
                distance: "Cosine",
            },
        };
        let resp = self
            .request(reqwest::Method::PUT, &format!("/collections/{name}"))
            .json(&body)
            .send()
            .await?;
        Self::check(resp, "collection create").await?;
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = UpsertBody {
            points: points
                .into_iter()
                .map(|p| WirePoint {
                    id: p.id,
                    vector: p.vector,
                    payload: p.payload,
                })
                .collect(),
        };
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&body)
            .send()
            .await?;
        Self::check(resp, "point upsert").await?;
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
        if !filter.has_scope() {
            return Err(Error::validation(
                codes::VECTOR_SCOPE_MISSING,
                "search filter must include tenant and knowledge-base scope",
            ));
        }
        let body = SearchBody {
            vector: vector.to_vec(),
            limit: top_k,
            with_payload: true,
            filter: WireFilter {
                must: filter
                    .conditions
                    .iter()
                    .map(|(key, value)| WireCondition {
                        key: key.clone(),
                        matches: WireMatch {
                            value: value.clone(),
                        },
                    })
                    .collect(),
            },
            score_threshold,
        };
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
            )
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp, "vector search").await?;
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(codes::VECTOR_UPSTREAM, e.to_string()))?;
        Ok(parsed
            .result
            .into_iter()
            .filter(|r| r.score >= score_threshold)
            .map(|r| VectorHit {
                id: point_id_string(&r.id),
                score: r.score,
                payload: r.payload.unwrap_or_default(),
            })
            .collect())
    }
}

/// Chunk hydration backed by qdrant point payloads.
pub struct QdrantChunkRepository {
    client: QdrantClient,
    collection: String,
}

impl QdrantChunkRepository {
    pub fn new(config: &QdrantConfig) -> Result<Self> {
        Ok(Self {
            client: QdrantClient::new(config)?,
            collection: config.collection.clone(),
        })
    }
}

#[async_trait]
impl ChunkRepository for QdrantChunkRepository {
    async fn load_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkMeta>> {
        let hits = self.client.retrieve_points(&self.collection, chunk_ids).await?;
        let mut by_id: HashMap<String, ChunkMeta> = hits
            .into_iter()
            .map(|h| {
                (
                    h.id.clone(),
                    ChunkMeta {
                        document_id: h.payload.document_id,
                        chunk_id: h.id,
                        content: h.payload.content,
                        section: h.payload.section,
                        page_no: h.payload.page_no,
                    },
                )
            })
            .collect();
        // Preserve the caller's requested order.
        Ok(chunk_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }
}

/// Build the point for one embedded chunk.
pub fn chunk_point(
    tenant_id: &str,
    kb_id: &str,
    document_id: &str,
    document_version_id: &str,
    embedded: &EmbeddedChunk,
) -> VectorPoint {
    VectorPoint {
        id: embedded.chunk.id.clone(),
        vector: embedded.vector.clone(),
        payload: ChunkPayload {
            tenant_id: tenant_id.to_string(),
            kb_id: kb_id.to_string(),
            document_id: document_id.to_string(),
            document_version_id: document_version_id.to_string(),
            chunk_index: embedded.chunk.chunk_index,
            content: embedded.chunk.content.clone(),
            section: embedded.chunk.section.clone(),
            page_no: embedded.chunk.page_no,
            source_uri: embedded.chunk.source_uri.clone(),
            language: embedded.chunk.language.clone(),
            content_hash: embedded.chunk.content_hash.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_filter_has_both_keys() {
        let filter = VectorFilter::scoped("t1", "kb1");
        assert!(filter.has_scope());
        assert_eq!(filter.conditions.len(), 2);
    }

    #[test]
    fn test_unscoped_filter_detected() {
        let filter = VectorFilter {
            conditions: vec![(SCOPE_TENANT.to_string(), "t1".to_string())],
        };
        assert!(!filter.has_scope());
    }

    #[test]
    fn test_search_body_wire_shape() {
        let body = SearchBody {
            vector: vec![0.1, 0.2],
            limit: 5,
            with_payload: true,
            filter: WireFilter {
                must: vec![WireCondition {
                    key: "tenant_id".to_string(),
                    matches: WireMatch {
                        value: "t1".to_string(),
                    },
                }],
            },
            score_threshold: 0.2,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["limit"], 5);
        assert_eq!(json["with_payload"], true);
        assert_eq!(json["filter"]["must"][0]["key"], "tenant_id");
        assert_eq!(json["filter"]["must"][0]["match"]["value"], "t1");
        assert!(json["score_threshold"].as_f64().is_some());
    }

    #[test]
    fn test_create_collection_wire_shape() {
        let body = CreateCollectionBody {
            vectors: VectorParams {
                size: 384,
                distance: "Cosine",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["vectors"]["size"], 384);
        assert_eq!(json["vectors"]["distance"], "Cosine");
    }

    #[test]
    fn test_search_response_parses_numeric_ids() {
        let raw = r#"{"result":[{"id":42,"score":0.9},{"id":"abc","score":0.5,"payload":{"tenant_id":"t","kb_id":"k","document_id":"d","document_version_id":"v","chunk_index":0,"content":"c","section":"","page_no":0,"source_uri":"","language":"","content_hash":""}}]}"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(point_id_string(&parsed.result[0].id), "42");
        assert_eq!(point_id_string(&parsed.result[1].id), "abc");
        assert!(parsed.result[0].payload.is_none());
    }
}
