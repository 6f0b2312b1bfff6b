//! Vector similarity index interface.
//!
//! The pipeline only needs two operations: embed a text and run a
//! nearest-neighbor search over a named corpus. Any ANN backend can sit
//! behind [`VectorIndex`]; the shipped implementations are a remote
//! index service and a small in-memory index for local corpora and
//! tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the vector index.
#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector index unreachable: {0}")]
    Connection(String),

    #[error("vector index request timed out")]
    Timeout,

    #[error("unknown corpus {0}")]
    UnknownCorpus(String),

    #[error("vector index response malformed: {0}")]
    Malformed(String),

    #[error("vector index error (status {status}): {body}")]
    Status { status: u16, body: String },
}

/// The corpora the pipeline searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corpus {
    Logs,
    Incidents,
    Runbooks,
}

impl Corpus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Corpus::Logs => "logs",
            Corpus::Incidents => "incidents",
            Corpus::Runbooks => "runbooks",
        }
    }
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub similarity: f64,
    /// Document payload: title, summary, service tags, and so on.
    pub payload: serde_json::Value,
}

/// Embedding + nearest-neighbor search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError>;

    async fn search(
        &self,
        corpus: Corpus,
        embedding: &[f32],
        k: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<SearchHit>, VectorError>;
}

// =============================================================================
// REMOTE INDEX
// =============================================================================

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    corpus: &'a str,
    embedding: &'a [f32],
    k: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    filters: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

/// Client for a remote vector index service.
#[derive(Debug, Clone)]
pub struct RemoteVectorIndex {
    base_url: String,
    embedding_model: String,
    client: reqwest::Client,
}

impl RemoteVectorIndex {
    pub fn new(base_url: &str, embedding_model: &str) -> Result<Self, VectorError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| VectorError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            embedding_model: embedding_model.to_string(),
            client,
        })
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, VectorError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                VectorError::Timeout
            } else {
                VectorError::Connection(e.to_string())
            }
        })?;

        match response.status().as_u16() {
            200 => response
                .json()
                .await
                .map_err(|e| VectorError::Malformed(e.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(VectorError::Status { status, body })
            }
        }
    }
}

#[async_trait]
impl VectorIndex for RemoteVectorIndex {
    #[instrument(skip(self, text), fields(backend = "vector"))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let response: EmbedResponse = self
            .post(
                "/v1/embed",
                &EmbedRequest {
                    model: &self.embedding_model,
                    text,
                },
            )
            .await?;
        Ok(response.embedding)
    }

    #[instrument(skip(self, embedding), fields(backend = "vector", corpus = corpus.as_str()))]
    async fn search(
        &self,
        corpus: Corpus,
        embedding: &[f32],
        k: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let response: SearchResponse = self
            .post(
                "/v1/search",
                &SearchRequest {
                    corpus: corpus.as_str(),
                    embedding,
                    k,
                    filters: filters.clone(),
                },
            )
            .await?;
        Ok(response.hits)
    }
}

// =============================================================================
// IN-MEMORY INDEX
// =============================================================================

const HASH_DIMENSIONS: usize = 256;

/// A small in-memory index over pre-loaded documents. Embeddings are
/// deterministic token-hash vectors, which is enough for local corpora
/// and deterministic tests; production deployments point at a remote
/// index instead.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    corpora: BTreeMap<&'static str, Vec<Document>>,
}

#[derive(Debug)]
struct Document {
    id: String,
    vector: Vec<f32>,
    payload: serde_json::Value,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document; its text is embedded immediately.
    pub fn insert(&mut self, corpus: Corpus, id: &str, text: &str, payload: serde_json::Value) {
        let vector = hash_embed(text);
        self.corpora
            .entry(corpus.as_str())
            .or_default()
            .push(Document {
                id: id.to_string(),
                vector,
                payload,
            });
    }

    pub fn len(&self, corpus: Corpus) -> usize {
        self.corpora.get(corpus.as_str()).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.corpora.values().all(Vec::is_empty)
    }
}

fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; HASH_DIMENSIONS];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
    {
        // FNV-1a over the token selects a dimension.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % HASH_DIMENSIONS as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

fn matches_filters(payload: &serde_json::Value, filters: &BTreeMap<String, String>) -> bool {
    filters.iter().all(|(key, want)| {
        payload
            .get(key)
            .map(|v| match v {
                serde_json::Value::String(s) => s.eq_ignore_ascii_case(want),
                serde_json::Value::Array(items) => items
                    .iter()
                    .any(|i| i.as_str().is_some_and(|s| s.eq_ignore_ascii_case(want))),
                other => other.to_string() == *want,
            })
            .unwrap_or(false)
    })
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        Ok(hash_embed(text))
    }

    async fn search(
        &self,
        corpus: Corpus,
        embedding: &[f32],
        k: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let docs = match self.corpora.get(corpus.as_str()) {
            Some(docs) => docs,
            None => return Ok(Vec::new()),
        };

        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter(|doc| matches_filters(&doc.payload, filters))
            .map(|doc| SearchHit {
                id: doc.id.clone(),
                similarity: cosine(embedding, &doc.vector),
                payload: doc.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_search_ranks_by_similarity() {
        let mut index = InMemoryIndex::new();
        index.insert(
            Corpus::Incidents,
            "INC-2023-089",
            "memory leak in connection pool after deployment",
            serde_json::json!({"title": "Memory leak in connection pool"}),
        );
        index.insert(
            Corpus::Incidents,
            "INC-2023-142",
            "certificate expiry broke ingress routing",
            serde_json::json!({"title": "Certificate expiry"}),
        );

        let query = index
            .embed("deployment caused memory leak and pool exhaustion")
            .await
            .unwrap();
        let hits = index
            .search(Corpus::Incidents, &query, 2, &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "INC-2023-089");
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[tokio::test]
    async fn filters_restrict_hits() {
        let mut index = InMemoryIndex::new();
        index.insert(
            Corpus::Runbooks,
            "rb-1",
            "api gateway error triage runbook",
            serde_json::json!({"service": "api-gateway"}),
        );
        index.insert(
            Corpus::Runbooks,
            "rb-2",
            "database failover runbook",
            serde_json::json!({"service": "postgres"}),
        );

        let query = index.embed("api gateway errors").await.unwrap();
        let mut filters = BTreeMap::new();
        filters.insert("service".to_string(), "api-gateway".to_string());
        let hits = index
            .search(Corpus::Runbooks, &query, 5, &filters)
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "rb-1");
    }

    #[tokio::test]
    async fn unknown_corpus_is_empty() {
        let index = InMemoryIndex::new();
        let hits = index
            .search(Corpus::Logs, &[0.0; 4], 5, &BTreeMap::new())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
