use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{Document, FileInfo};
use super::Database;
use crate::embedding::{bytes_to_embedding, embedding_to_bytes};
use crate::error::{AppError, Result};

const DOCUMENT_COLUMNS: &str =
    "id, title, content, file_type, file_path, chunk_index, metadata, embedding, created_at";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    let chunk_index: Option<i64> = row.get(5)?;
    let metadata: String = row.get(6)?;
    let embedding: Vec<u8> = row.get(7)?;
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        file_type: row.get(3)?,
        file_path: row.get(4)?,
        chunk_index: chunk_index.map(|i| i as usize),
        metadata: serde_json::from_str(&metadata).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        embedding: Some(bytes_to_embedding(&embedding)),
        created_at: row.get(8)?,
    })
}

fn file_name_of(file_path: &str) -> String {
    std::path::Path::new(file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_path)
        .to_string()
}

fn stored_dimension(conn: &Connection) -> Result<Option<usize>> {
    let len: Option<i64> = conn
        .query_row("SELECT length(embedding) FROM documents LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(len.map(|bytes| bytes as usize / 4))
}

impl Database {
    /// Dimension of the vectors already stored, if any.
    pub fn embedding_dimension(&self) -> Result<Option<usize>> {
        let conn = self.conn()?;
        stored_dimension(&conn)
    }

    /// Store embedded chunks. Every chunk must carry an embedding of the
    /// collection's dimension; otherwise nothing is written. Chunks for a
    /// path that is already stored replace the previous ones, so the
    /// dimension is compared only against the chunks that remain.
    pub fn store_documents(&self, documents: &[Document]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let mut incoming: Option<usize> = None;
        for doc in documents {
            let embedding = doc.embedding.as_ref().filter(|e| !e.is_empty()).ok_or_else(|| {
                AppError::MissingEmbedding {
                    chunk_id: doc.id.clone(),
                    file_path: doc.file_path.clone(),
                }
            })?;
            match incoming {
                Some(dim) if dim != embedding.len() => {
                    return Err(AppError::DimensionMismatch {
                        expected: dim,
                        actual: embedding.len(),
                    })
                }
                Some(_) => {}
                None => incoming = Some(embedding.len()),
            }
        }

        let paths: BTreeSet<&str> = documents.iter().map(|d| d.file_path.as_str()).collect();
        let mut conn = self.conn()?;
        // Dropping the transaction on an early return rolls the deletes back.
        let tx = conn.transaction()?;
        for path in &paths {
            let replaced = tx.execute("DELETE FROM documents WHERE file_path = ?1", params![path])?;
            if replaced > 0 {
                tracing::debug!(file = %path, replaced, "Replacing previously stored chunks");
            }
        }
        if let (Some(expected), Some(actual)) = (stored_dimension(&tx)?, incoming) {
            if expected != actual {
                return Err(AppError::DimensionMismatch { expected, actual });
            }
        }
        for doc in documents {
            let embedding = doc.embedding.as_deref().unwrap_or_default();
            tx.execute(
                &format!("INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    doc.id,
                    doc.title,
                    doc.content,
                    doc.file_type,
                    doc.file_path,
                    doc.chunk_index.map(|i| i as i64),
                    serde_json::to_string(&doc.metadata)?,
                    embedding_to_bytes(embedding),
                    doc.created_at,
                ],
            )?;
        }
        tx.commit()?;

        tracing::info!(chunks = documents.len(), files = paths.len(), "Stored document chunks");
        Ok(documents.len())
    }

    /// All stored chunks, optionally restricted to the given file paths.
    pub fn embedded_documents(&self, file_paths: Option<&[String]>) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY file_path ASC, chunk_index ASC"
        ))?;
        let rows = stmt.query_map([], document_from_row)?;
        let mut docs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if let Some(paths) = file_paths {
            docs.retain(|d| paths.iter().any(|p| p == &d.file_path));
        }
        Ok(docs)
    }

    pub fn get_file_chunks(&self, file_path: &str) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE file_path = ?1 ORDER BY chunk_index ASC"
        ))?;
        let rows = stmt.query_map(params![file_path], document_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_files(&self) -> Result<Vec<FileInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, MIN(file_type), COUNT(*), MIN(created_at) FROM documents \
             GROUP BY file_path ORDER BY MIN(created_at) DESC, file_path ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let file_path: String = row.get(0)?;
            let chunk_count: i64 = row.get(2)?;
            Ok(FileInfo {
                file_name: file_name_of(&file_path),
                file_path,
                file_type: row.get(1)?,
                chunk_count: chunk_count as usize,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn has_file(&self, file_path: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE file_path = ?1",
            params![file_path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Remove every chunk of a file in one transaction. Returns the number
    /// of chunks removed.
    pub fn delete_file_by_path(&self, file_path: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM documents WHERE file_path = ?1", params![file_path])?;
        tx.commit()?;
        tracing::info!(file = %file_path, removed, "Deleted file chunks");
        Ok(removed)
    }

    pub fn count_documents(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn clear_documents(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM documents", [])?;
        tracing::info!(removed, "Cleared document store");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, index: usize, embedding: Option<Vec<f32>>) -> Document {
        let mut doc = Document::new(
            format!("doc - Part {}", index + 1),
            format!("content {index}"),
            "txt".into(),
            path.into(),
            Some(index),
        );
        doc.embedding = embedding;
        doc
    }

    #[test]
    fn rejects_unembedded_chunks_without_partial_write() {
        let db = Database::open_in_memory().unwrap();
        let docs = vec![
            chunk("/a.txt", 0, Some(vec![1.0, 0.0])),
            chunk("/a.txt", 1, None),
        ];
        let err = db.store_documents(&docs).unwrap_err();
        assert!(matches!(err, AppError::MissingEmbedding { .. }));
        assert_eq!(db.count_documents().unwrap(), 0);
    }

    #[test]
    fn rejects_dimension_mismatch_against_existing_vectors() {
        let db = Database::open_in_memory().unwrap();
        db.store_documents(&[chunk("/a.txt", 0, Some(vec![1.0, 0.0]))])
            .unwrap();
        let err = db
            .store_documents(&[chunk("/b.txt", 0, Some(vec![1.0, 0.0, 0.0]))])
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn replacing_the_only_file_may_change_dimension() {
        let db = Database::open_in_memory().unwrap();
        db.store_documents(&[chunk("/a.txt", 0, Some(vec![1.0, 0.0]))])
            .unwrap();
        db.store_documents(&[chunk("/a.txt", 0, Some(vec![1.0, 0.0, 0.0]))])
            .unwrap();
        assert_eq!(db.embedding_dimension().unwrap(), Some(3));

        // With another file left at the new size, the old size is refused and
        // the rejected replacement leaves the existing chunks alone.
        db.store_documents(&[chunk("/b.txt", 0, Some(vec![0.0, 1.0, 0.0]))])
            .unwrap();
        let err = db
            .store_documents(&[chunk("/a.txt", 0, Some(vec![1.0, 0.0]))])
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(db.get_file_chunks("/a.txt").unwrap().len(), 1);
        assert_eq!(db.count_documents().unwrap(), 2);
    }

    #[test]
    fn files_are_aggregated_and_deleted_atomically() {
        let db = Database::open_in_memory().unwrap();
        let docs: Vec<Document> = (0..3)
            .map(|i| chunk("/docs/report.txt", i, Some(vec![i as f32, 1.0])))
            .chain(std::iter::once(chunk("/docs/other.md", 0, Some(vec![0.0, 1.0]))))
            .collect();
        db.store_documents(&docs).unwrap();

        let files = db.list_files().unwrap();
        let report = files
            .iter()
            .find(|f| f.file_path == "/docs/report.txt")
            .unwrap();
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.file_name, "report.txt");

        let chunks = db.get_file_chunks("/docs/report.txt").unwrap();
        let indices: Vec<_> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(chunks[2].embedding.as_deref(), Some(&[2.0, 1.0][..]));

        assert_eq!(db.delete_file_by_path("/docs/report.txt").unwrap(), 3);
        assert!(db.get_file_chunks("/docs/report.txt").unwrap().is_empty());
        assert!(db
            .list_files()
            .unwrap()
            .iter()
            .all(|f| f.file_path != "/docs/report.txt"));
        assert_eq!(db.count_documents().unwrap(), 1);
    }

    #[test]
    fn restoring_a_path_replaces_old_chunks() {
        let db = Database::open_in_memory().unwrap();
        let first: Vec<_> = (0..3).map(|i| chunk("/a.txt", i, Some(vec![1.0]))).collect();
        db.store_documents(&first).unwrap();
        db.store_documents(&[chunk("/a.txt", 0, Some(vec![1.0]))])
            .unwrap();
        assert_eq!(db.get_file_chunks("/a.txt").unwrap().len(), 1);
        assert!(db.has_file("/a.txt").unwrap());
    }

    #[test]
    fn metadata_survives_storage() {
        let db = Database::open_in_memory().unwrap();
        let mut doc = chunk("/a.txt", 0, Some(vec![1.0]));
        doc.metadata.insert("embedding_model".into(), "bge".into());
        db.store_documents(&[doc]).unwrap();
        let stored = db.embedded_documents(None).unwrap();
        assert_eq!(stored[0].metadata.get("embedding_model").unwrap(), "bge");
        assert_eq!(db.clear_documents().unwrap(), 1);
    }
}
