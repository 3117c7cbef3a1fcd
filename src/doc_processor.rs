use std::fs;
use std::path::Path;

use crate::db::models::Document;
use crate::error::{AppError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const TEXT_EXTENSIONS: &[&str] = &["txt", "log", "csv", "json"];

/// Parsed document content
pub struct ParsedDocument {
    pub content: String,
    pub file_type: String,
}

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

/// Parse a document file into plain text
pub fn parse_file(path: &Path) -> Result<ParsedDocument> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    let doc_err = |message: String| AppError::Document {
        file: path.display().to_string(),
        message,
    };

    match ext.as_str() {
        "md" | "markdown" => {
            let content = fs::read_to_string(path).map_err(|e| doc_err(e.to_string()))?;
            Ok(ParsedDocument {
                content,
                file_type: "md".into(),
            })
        }
        "pdf" => {
            let bytes = fs::read(path).map_err(|e| doc_err(e.to_string()))?;
            let content = pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| doc_err(format!("PDF parse error: {}", e)))?;
            Ok(ParsedDocument {
                content,
                file_type: "pdf".into(),
            })
        }
        ext if TEXT_EXTENSIONS.contains(&ext) => {
            let content = fs::read_to_string(path).map_err(|e| doc_err(e.to_string()))?;
            Ok(ParsedDocument {
                content,
                file_type: ext.to_string(),
            })
        }
        other => Err(AppError::UnsupportedFileType(other.to_string())),
    }
}

/// Split text into fixed-width character windows. Consecutive windows share
/// `overlap` characters; the last window may be shorter.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || chunk_size == 0 {
        return vec![];
    }

    let stride = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end >= chars.len() {
            break;
        }
        start += stride;
    }

    chunks
}

/// Read, parse and chunk a file. Chunks are numbered from zero without gaps
/// and are not yet embedded.
pub fn process_document(file_path: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Document>> {
    let path = Path::new(file_path);
    let parsed = parse_file(path)?;
    if parsed.content.trim().is_empty() {
        return Err(AppError::EmptyDocument(file_path.to_string()));
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .to_string();
    let chunks = chunk_text(&parsed.content, chunk_size, overlap);
    let total = chunks.len();

    let documents: Vec<Document> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let mut doc = Document::new(
                format!("{} - Part {}", stem, i + 1),
                content,
                parsed.file_type.clone(),
                file_path.to_string(),
                Some(i),
            );
            doc.metadata.insert("total_chunks".into(), total.to_string());
            doc
        })
        .collect();

    tracing::debug!(file = %file_path, chunks = documents.len(), "Document chunked");
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_chunks(len: usize) -> usize {
        let rest = len.saturating_sub(DEFAULT_CHUNK_SIZE);
        rest.div_ceil(DEFAULT_CHUNK_SIZE - DEFAULT_CHUNK_OVERLAP) + 1
    }

    #[test]
    fn test_chunk_text_short() {
        let chunks = chunk_text("Hello world", 100, 20);
        assert_eq!(chunks, vec!["Hello world"]);
    }

    #[test]
    fn test_chunk_text_overlap() {
        let text: String = ('a'..='z').cycle().take(100).collect();
        let chunks = chunk_text(&text, 40, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 40);
        assert_eq!(&chunks[0][30..], &chunks[1][..10]);
    }

    #[test]
    fn chunk_count_follows_window_and_stride() {
        for len in [1, 999, 1000, 1001, 1800, 1801, 2400, 5000] {
            let text = "x".repeat(len);
            let chunks = chunk_text(&text, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
            assert_eq!(chunks.len(), expected_chunks(len), "length {len}");
        }
    }

    #[test]
    fn chunking_counts_characters_not_bytes() {
        let text = "ü".repeat(1500);
        let chunks = chunk_text(&text, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 1000);
        assert_eq!(chunks[1].chars().count(), 700);
    }

    #[test]
    fn processes_text_file_into_contiguous_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "n".repeat(2400)).unwrap();
        let path = path.to_string_lossy().to_string();

        let docs = process_document(&path, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP).unwrap();
        assert_eq!(docs.len(), 3);
        for (i, doc) in docs.iter().enumerate() {
            assert_eq!(doc.chunk_index, Some(i));
            assert_eq!(doc.file_path, path);
            assert!(doc.embedding.is_none());
        }
        assert_eq!(docs[0].title, "notes - Part 1");
        assert_eq!(docs[0].file_type, "txt");
    }

    #[test]
    fn rejects_empty_and_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.md");
        fs::write(&empty, "   \n").unwrap();
        let err = process_document(&empty.to_string_lossy(), 1000, 200).unwrap_err();
        assert!(matches!(err, AppError::EmptyDocument(_)));

        let bin = dir.path().join("archive.zip");
        fs::write(&bin, [0u8; 4]).unwrap();
        let err = process_document(&bin.to_string_lossy(), 1000, 200).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFileType(ext) if ext == "zip"));
    }

    #[test]
    fn image_extensions_are_recognised() {
        assert!(is_image_extension("PNG"));
        assert!(is_image_extension("jpeg"));
        assert!(!is_image_extension("pdf"));
    }
}
