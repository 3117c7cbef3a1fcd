use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::db::models::{AttachmentRef, Document};
use crate::db::Database;
use crate::doc_processor;
use crate::embedding::{ChunkFailure, EmbedOutcome, EmbeddingService};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub file_path: String,
    pub file_name: String,
    pub chunks_total: usize,
    pub chunks_stored: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file_path: String,
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<IngestReport>,
    pub failed: Vec<FileFailure>,
}

fn file_name_of(file_path: &str) -> String {
    Path::new(file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_path)
        .to_string()
}

/// Number each file's surviving chunks 0..n in their current order and
/// record the count as `total_chunks`. The position a chunk had before
/// failures were dropped is kept as `source_chunk_index`.
fn close_gaps(documents: &mut [Document]) {
    let mut totals: HashMap<String, usize> = HashMap::new();
    for doc in documents.iter() {
        *totals.entry(doc.file_path.clone()).or_default() += 1;
    }
    let mut next: HashMap<String, usize> = HashMap::new();
    for doc in documents.iter_mut() {
        let index = next.entry(doc.file_path.clone()).or_default();
        if let Some(original) = doc.chunk_index {
            doc.metadata
                .insert("source_chunk_index".into(), original.to_string());
        }
        doc.chunk_index = Some(*index);
        *index += 1;
        let total = totals.get(&doc.file_path).copied().unwrap_or_default();
        doc.metadata.insert("total_chunks".into(), total.to_string());
    }
}

/// Chunk → embed → store. A chunk only reaches the store once it carries
/// its embedding.
pub struct Ingestor {
    db: Arc<Database>,
    embeddings: EmbeddingService,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Ingestor {
    pub fn new(
        db: Arc<Database>,
        embeddings: EmbeddingService,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            db,
            embeddings,
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn process_document(&self, file_path: &str) -> Result<Vec<Document>> {
        doc_processor::process_document(file_path, self.chunk_size, self.chunk_overlap)
    }

    /// Embed chunks. Chunks that fail are left out, and the rest are
    /// renumbered so every file's chunks stay contiguous from zero.
    pub async fn create_document_embeddings(&self, documents: Vec<Document>) -> EmbedOutcome {
        let mut outcome = self.embeddings.embed_documents(documents).await;
        close_gaps(&mut outcome.embedded);
        outcome
    }

    pub fn store_documents(&self, documents: &[Document]) -> Result<usize> {
        self.db.store_documents(documents)
    }

    pub async fn ingest_file(&self, file_path: &str) -> Result<IngestReport> {
        let file_name = file_name_of(file_path);
        tracing::info!(file = %file_path, "Ingesting document");

        let chunks = self.process_document(file_path)?;
        let chunks_total = chunks.len();
        let outcome = self.create_document_embeddings(chunks).await;

        if outcome.embedded.is_empty() {
            let reason = outcome
                .failed
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_else(|| "no chunks produced".into());
            return Err(AppError::Embedding(format!(
                "no chunk of {} could be embedded: {}",
                file_name, reason
            )));
        }

        let chunks_stored = self.store_documents(&outcome.embedded)?;
        if !outcome.failed.is_empty() {
            tracing::warn!(
                file = %file_path,
                stored = chunks_stored,
                failed = outcome.failed.len(),
                "Document stored with missing chunks"
            );
        }

        Ok(IngestReport {
            file_path: file_path.to_string(),
            file_name,
            chunks_total,
            chunks_stored,
            failed_chunks: outcome.failed,
        })
    }

    /// Ingest files one after another. A failing file is reported by name
    /// and does not undo or stop the others.
    pub async fn ingest_files(&self, file_paths: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for path in file_paths {
            match self.ingest_file(path).await {
                Ok(done) => report.succeeded.push(done),
                Err(e) => {
                    tracing::error!(file = %path, error = %e, "Document ingestion failed");
                    report.failed.push(FileFailure {
                        file_path: path.clone(),
                        file_name: file_name_of(path),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Make sure every non-image attachment is in the store before the turn
    /// references it. Images are passed through untouched.
    pub async fn prepare_attachments(&self, attachments: &[AttachmentRef]) -> BatchReport {
        let mut pending = Vec::new();
        let mut unchecked = Vec::new();
        for attachment in attachments.iter().filter(|a| !a.is_image) {
            match self.db.has_file(&attachment.file_path) {
                Ok(true) => {}
                Ok(false) => pending.push(attachment.file_path.clone()),
                Err(e) => {
                    tracing::warn!(file = %attachment.file_path, error = %e, "Could not check the store for attachment");
                    unchecked.push(FileFailure {
                        file_path: attachment.file_path.clone(),
                        file_name: attachment.file_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        let mut report = self.ingest_files(&pending).await;
        report.failed.extend(unchecked);
        report
    }
}
