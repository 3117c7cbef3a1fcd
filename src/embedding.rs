use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::db::models::Document;
use crate::error::{AppError, Result};
use crate::llm::openai::OpenAiConfig;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Turns text into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            config,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .header("Content-Type", "application/json")
            .json(&body);

        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AppError::Embedding(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Embedding(format!("API error {}: {}", status, text)));
        }

        let mut data: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Embedding(e.to_string()))?;
        data.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Scale a vector to unit length in place. Zero vectors are left as is.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Rank documents against a query embedding. Equal scores order by newer
/// `created_at`, then by lower chunk index.
pub fn search_similar(
    query_embedding: &[f32],
    documents: Vec<Document>,
    top_k: Option<usize>,
) -> Vec<(Document, f32)> {
    let mut scored: Vec<(Document, f32)> = documents
        .into_iter()
        .map(|doc| {
            let score = doc
                .embedding
                .as_deref()
                .map(|emb| cosine_similarity(query_embedding, emb))
                .unwrap_or(0.0);
            (doc, score)
        })
        .collect();

    scored.sort_by(|(da, a), (db, b)| {
        b.partial_cmp(a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| db.created_at.cmp(&da.created_at))
            .then_with(|| da.chunk_index.cmp(&db.chunk_index))
    });
    if let Some(k) = top_k {
        scored.truncate(k);
    }
    scored
}

/// Serialize embedding to bytes for SQLite BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize embedding from SQLite BLOB bytes
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Result of embedding a batch of chunks: the chunks that now carry a
/// vector, and the chunk indices that could not be embedded.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub embedded: Vec<Document>,
    pub failed: Vec<ChunkFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub chunk_index: Option<usize>,
    pub error: String,
}

/// Shared by ingestion and querying so both sides land in the same vector
/// space.
#[derive(Clone)]
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    normalize: bool,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, normalize: bool) -> Self {
        Self {
            embedder,
            normalize,
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    fn finish(&self, mut vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.is_empty() || vector.iter().any(|x| !x.is_finite()) {
            return Err(AppError::Embedding("model returned an unusable vector".into()));
        }
        if self.normalize {
            normalize(&mut vector);
        }
        Ok(vector)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embedder.embed(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| AppError::Embedding("no embedding returned for query".into()))?;
        self.finish(vector)
    }

    /// Embed all chunks in one batch. If the batch call fails or returns the
    /// wrong number of vectors, each chunk is retried on its own so that one
    /// bad chunk does not sink its siblings.
    pub async fn embed_documents(&self, documents: Vec<Document>) -> EmbedOutcome {
        let mut outcome = EmbedOutcome::default();
        if documents.is_empty() {
            return outcome;
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let batch = match self.embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == documents.len() => Some(vectors),
            Ok(vectors) => {
                tracing::warn!(
                    expected = documents.len(),
                    received = vectors.len(),
                    "Embedding batch size mismatch, embedding chunks individually"
                );
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, chunks = documents.len(), "Embedding batch failed, embedding chunks individually");
                None
            }
        };

        match batch {
            Some(vectors) => {
                for (doc, vector) in documents.into_iter().zip(vectors) {
                    self.attach(doc, Ok(vector), &mut outcome);
                }
            }
            None => {
                for doc in documents {
                    let single = self
                        .embedder
                        .embed(std::slice::from_ref(&doc.content))
                        .await
                        .and_then(|mut v| {
                            v.pop().ok_or_else(|| {
                                AppError::Embedding("no embedding returned".into())
                            })
                        });
                    self.attach(doc, single, &mut outcome);
                }
            }
        }

        tracing::debug!(
            embedded = outcome.embedded.len(),
            failed = outcome.failed.len(),
            model = %self.model_name(),
            "Embedded document chunks"
        );
        outcome
    }

    fn attach(&self, mut doc: Document, vector: Result<Vec<f32>>, outcome: &mut EmbedOutcome) {
        match vector.and_then(|v| self.finish(v)) {
            Ok(v) => {
                doc.embedding = Some(v);
                doc.metadata
                    .insert("embedding_model".into(), self.model_name().to_string());
                outcome.embedded.push(doc);
            }
            Err(e) => {
                tracing::warn!(chunk_id = %doc.id, chunk_index = ?doc.chunk_index, error = %e, "Chunk embedding failed");
                outcome.failed.push(ChunkFailure {
                    chunk_id: doc.id,
                    chunk_index: doc.chunk_index,
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{HashEmbedder, chunk_doc};

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_roundtrip() {
        let emb = vec![0.1, 0.2, -0.3, 0.4];
        let bytes = embedding_to_bytes(&emb);
        let back = bytes_to_embedding(&bytes);
        assert_eq!(emb, back);
    }

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn ties_prefer_newer_chunks() {
        let mut old = chunk_doc("/a.txt", 0, "x");
        old.embedding = Some(vec![1.0, 0.0]);
        old.created_at = 10;
        let mut new = chunk_doc("/b.txt", 0, "x");
        new.embedding = Some(vec![1.0, 0.0]);
        new.created_at = 20;
        let mut far = chunk_doc("/c.txt", 0, "y");
        far.embedding = Some(vec![0.0, 1.0]);

        let ranked = search_similar(&[1.0, 0.0], vec![old, far, new], Some(2));
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0.file_path, "/b.txt");
        assert_eq!(ranked[1].0.file_path, "/a.txt");
    }

    #[tokio::test]
    async fn one_bad_chunk_does_not_discard_siblings() {
        let embedder = Arc::new(HashEmbedder::new(16).failing_on("poison"));
        let service = EmbeddingService::new(embedder, true);
        let docs = vec![
            chunk_doc("/a.txt", 0, "alpha beta"),
            chunk_doc("/a.txt", 1, "poison pill"),
            chunk_doc("/a.txt", 2, "gamma delta"),
        ];
        let outcome = service.embed_documents(docs).await;
        assert_eq!(outcome.embedded.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].chunk_index, Some(1));
        for doc in &outcome.embedded {
            let v = doc.embedding.as_ref().unwrap();
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
            assert_eq!(doc.metadata.get("embedding_model").unwrap(), "hash-embedder");
        }
    }

    #[tokio::test]
    async fn query_and_document_share_vector_space() {
        let service = EmbeddingService::new(Arc::new(HashEmbedder::new(32)), true);
        let outcome = service
            .embed_documents(vec![chunk_doc("/a.txt", 0, "the quick brown fox")])
            .await;
        let query = service.embed_query("the quick brown fox").await.unwrap();
        let stored = outcome.embedded[0].embedding.as_ref().unwrap();
        assert!((cosine_similarity(&query, stored) - 1.0).abs() < 1e-5);
    }
}
