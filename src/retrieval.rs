use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::db::models::{AttachmentRef, Document, SearchResult};
use crate::db::Database;
use crate::embedding::{search_similar, EmbeddingService};
use crate::error::{AppError, Result};
use crate::llm::openai::OpenAiConfig;

/// Which chunks a turn may draw context from.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalScope {
    /// The `top_k` most similar chunks across the whole collection.
    Global { top_k: usize },
    /// Every chunk of these files, regardless of rank.
    Files(Vec<String>),
}

impl RetrievalScope {
    /// Attached documents win over the global setting; the two are never
    /// combined. Images do not count as documents.
    pub fn for_turn(use_rag: bool, rag_limit: usize, attachments: &[AttachmentRef]) -> Option<Self> {
        let files: Vec<String> = attachments
            .iter()
            .filter(|a| !a.is_image)
            .map(|a| a.file_path.clone())
            .collect();
        if !files.is_empty() {
            Some(RetrievalScope::Files(files))
        } else if use_rag {
            Some(RetrievalScope::Global {
                top_k: rag_limit.max(1),
            })
        } else {
            None
        }
    }
}

/// Second-stage relevance scoring. Returns one score per document, in
/// input order.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

/// Reranker served from a `/rerank` endpoint (Cohere/OVMS style).
pub struct HttpReranker {
    client: Client,
    config: OpenAiConfig,
    model: String,
}

impl HttpReranker {
    pub fn new(config: OpenAiConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            config,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
        };
        let mut req = self
            .client
            .post(format!("{}/rerank", self.config.base_url))
            .json(&body);
        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AppError::Embedding(format!("rerank request failed: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Embedding(format!("rerank API error {}: {}", status, text)));
        }
        let data: RerankResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Embedding(e.to_string()))?;

        let mut scores = vec![f32::NAN; documents.len()];
        for r in data.results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.relevance_score;
            }
        }
        if scores.iter().any(|s| s.is_nan()) {
            return Err(AppError::Embedding(
                "reranker did not score every candidate".into(),
            ));
        }
        Ok(scores)
    }
}

pub struct Retriever {
    db: Arc<Database>,
    embeddings: EmbeddingService,
    reranker: Option<Arc<dyn Reranker>>,
}

impl Retriever {
    pub fn new(db: Arc<Database>, embeddings: EmbeddingService) -> Self {
        Self {
            db,
            embeddings,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub async fn retrieve(&self, query: &str, scope: &RetrievalScope) -> Result<Vec<SearchResult>> {
        match scope {
            RetrievalScope::Files(paths) => {
                // Whole files, kept in reading order.
                let docs = self.same_model(self.db.embedded_documents(Some(paths))?);
                // Scores are informational here; the chunks are included anyway.
                let query_embedding = match self.embeddings.embed_query(query).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "Query embedding failed, attaching files unscored");
                        Vec::new()
                    }
                };
                let ranked = search_similar(&query_embedding, docs, None);
                let mut results: Vec<SearchResult> = ranked
                    .into_iter()
                    .map(|(document, score)| SearchResult {
                        document,
                        score,
                        rerank_score: None,
                    })
                    .collect();
                results.sort_by(|a, b| {
                    let pos = |d: &Document| paths.iter().position(|p| p == &d.file_path);
                    pos(&a.document)
                        .cmp(&pos(&b.document))
                        .then_with(|| a.document.chunk_index.cmp(&b.document.chunk_index))
                });
                Ok(results)
            }
            RetrievalScope::Global { top_k } => {
                let docs = self.same_model(self.db.embedded_documents(None)?);
                if docs.is_empty() {
                    return Ok(Vec::new());
                }
                let query_embedding = self.embeddings.embed_query(query).await?;
                if let Some(dim) = docs.first().and_then(|d| d.embedding.as_ref()).map(Vec::len) {
                    if dim != query_embedding.len() {
                        return Err(AppError::DimensionMismatch {
                            expected: dim,
                            actual: query_embedding.len(),
                        });
                    }
                }
                let results = search_similar(&query_embedding, docs, Some(*top_k))
                    .into_iter()
                    .map(|(document, score)| SearchResult {
                        document,
                        score,
                        rerank_score: None,
                    })
                    .collect();
                Ok(self.rerank(query, results).await)
            }
        }
    }

    /// Drop chunks embedded by a different model than the one answering
    /// queries. Their vectors live in another space even when the
    /// dimension matches. Chunks without a recorded model are kept.
    fn same_model(&self, mut docs: Vec<Document>) -> Vec<Document> {
        let model = self.embeddings.model_name();
        let before = docs.len();
        docs.retain(|d| {
            d.metadata
                .get("embedding_model")
                .map_or(true, |m| m == model)
        });
        let skipped = before - docs.len();
        if skipped > 0 {
            tracing::warn!(
                skipped,
                model = %model,
                "Chunks embedded with another model were skipped; re-upload them to search them again"
            );
        }
        docs
    }

    /// Like [`Retriever::retrieve`], but a failure means "no context" rather
    /// than a failed turn.
    pub async fn retrieve_or_empty(&self, query: &str, scope: &RetrievalScope) -> Vec<SearchResult> {
        match self.retrieve(query, scope).await {
            Ok(results) => {
                tracing::debug!(results = results.len(), "Retrieved context");
                results
            }
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed, continuing without context");
                Vec::new()
            }
        }
    }

    /// Reorder candidates by reranker score. The candidate set is never
    /// changed; on any reranker problem the similarity order stands.
    async fn rerank(&self, query: &str, mut results: Vec<SearchResult>) -> Vec<SearchResult> {
        let Some(reranker) = &self.reranker else {
            return results;
        };
        if results.len() < 2 {
            return results;
        }
        let texts: Vec<String> = results.iter().map(|r| r.document.content.clone()).collect();
        match reranker.rerank(query, &texts).await {
            Ok(scores) if scores.len() == results.len() => {
                for (result, score) in results.iter_mut().zip(scores) {
                    result.rerank_score = Some(score);
                }
                // Stable sort keeps similarity order between equal scores.
                results.sort_by(|a, b| {
                    b.rerank_score
                        .partial_cmp(&a.rerank_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                results
            }
            Ok(scores) => {
                tracing::warn!(
                    expected = results.len(),
                    received = scores.len(),
                    "Reranker returned wrong number of scores, keeping similarity order"
                );
                results
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reranking failed, keeping similarity order");
                results
            }
        }
    }
}

/// Render retrieved chunks for the system prompt.
pub fn format_context(results: &[SearchResult]) -> String {
    let mut out = String::from(
        "Use the following excerpts from the user's documents to answer. \
         If they are not relevant, answer from your own knowledge.\n",
    );
    for (i, r) in results.iter().enumerate() {
        let file_name = std::path::Path::new(&r.document.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&r.document.file_path);
        out.push_str(&format!(
            "\n[{}] {} (chunk {})\n{}\n",
            i + 1,
            file_name,
            r.document.chunk_index.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            r.document.content
        ));
    }
    out
}
