//! Document parsing, normalization and chunking
//!
//! Supported formats are plain text, Markdown and CSV. Text is normalized,
//! split into sentences, then packed greedily into chunks with a sentence-
//! aligned overlap carried between consecutive chunks.

use crate::config::DocumentConfig;
use crate::error::{RagError, Result};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// A contiguous span of normalized document text with its position
#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunk {
    pub chunk_id: Uuid,
    pub text: String,
    pub source_file: String,
    pub chunk_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Metadata extracted from one processed document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub file_name: String,
    pub file_size: usize,
    pub file_type: String,
    pub encoding: String,
    pub word_count: usize,
    pub char_count: usize,
    pub chunk_count: usize,
    pub processing_time: f64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Cumulative processing counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessingMetrics {
    pub total_documents: u64,
    pub total_chunks: u64,
    pub total_processing_time: f64,
    pub errors: Vec<String>,
}

/// Document processor for multi-format parsing and chunking
pub struct DocumentProcessor {
    config: DocumentConfig,
    min_chunk_size: usize,
    metrics: std::sync::Mutex<ProcessingMetrics>,
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

impl DocumentProcessor {
    /// Create a new processor
    pub fn new(config: DocumentConfig) -> Self {
        let min_chunk_size = config.chunk_size / 4;
        Self {
            config,
            min_chunk_size,
            metrics: std::sync::Mutex::new(ProcessingMetrics::default()),
        }
    }

    /// Process a document from disk
    pub fn process_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(Vec<DocumentChunk>, DocumentMetadata)> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RagError::InvalidInput(format!("Invalid path: {}", path.display())))?
            .to_string();
        let bytes = std::fs::read(path)?;
        self.process_bytes(&bytes, &file_name)
    }

    /// Process a document from raw bytes plus its logical filename
    pub fn process_bytes(
        &self,
        bytes: &[u8],
        file_name: &str,
    ) -> Result<(Vec<DocumentChunk>, DocumentMetadata)> {
        let start = Instant::now();

        let max_bytes = self.config.max_file_size_mb * 1024 * 1024;
        if bytes.len() as u64 > max_bytes {
            return Err(RagError::InvalidInput(format!(
                "File size {} exceeds limit of {} bytes",
                bytes.len(),
                max_bytes
            )));
        }

        let extension = Path::new(file_name)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        let (text, encoding) = decode_text(bytes)?;

        let raw_text = match extension.as_str() {
            "txt" => text,
            "md" => strip_markdown(&text),
            "csv" => render_csv(&text)?,
            other => {
                return Err(RagError::UnsupportedFormat(format!(".{other}")));
            }
        };

        let cleaned = normalize_text(&raw_text);
        let chunks = self.generate_chunks(&cleaned, file_name)?;

        if chunks.len() > self.config.max_chunks_per_document {
            let msg = format!(
                "Document produced {} chunks, limit is {}",
                chunks.len(),
                self.config.max_chunks_per_document
            );
            self.metrics.lock().unwrap().errors.push(msg.clone());
            return Err(RagError::InvalidInput(msg));
        }

        let mut hasher = Md5::new();
        hasher.update(bytes);
        let content_hash = format!("{:x}", hasher.finalize());

        let processing_time = start.elapsed().as_secs_f64();
        let metadata = DocumentMetadata {
            file_name: file_name.to_string(),
            file_size: bytes.len(),
            file_type: format!(".{extension}"),
            encoding: encoding.to_string(),
            word_count: cleaned.split_whitespace().count(),
            char_count: cleaned.chars().count(),
            chunk_count: chunks.len(),
            processing_time,
            content_hash,
            created_at: Utc::now(),
        };

        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.total_documents += 1;
            metrics.total_chunks += chunks.len() as u64;
            metrics.total_processing_time += processing_time;
        }

        info!(
            "Processed {}: {} chunks in {:.3}s",
            file_name,
            chunks.len(),
            processing_time
        );

        Ok((chunks, metadata))
    }

    /// Pack sentences greedily into chunks with sentence-aligned overlap
    fn generate_chunks(&self, text: &str, source_file: &str) -> Result<Vec<DocumentChunk>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0usize;
        let mut chunk_index = 0usize;
        let mut start_char = 0usize;

        for sentence in &sentences {
            let sentence_len = sentence.chars().count();

            if current_len + sentence_len > self.config.chunk_size && !current.is_empty() {
                let chunk_text = current.join(" ");
                let end_char = start_char + chunk_text.chars().count();
                chunks.push(self.make_chunk(
                    &chunk_text,
                    source_file,
                    chunk_index,
                    start_char,
                    end_char,
                ));
                chunk_index += 1;

                let overlap = overlap_suffix(&current, self.config.chunk_overlap);
                let overlap_len = if overlap.is_empty() {
                    0
                } else {
                    overlap.join(" ").chars().count()
                };
                start_char = end_char - overlap_len;

                current = overlap;
                current.push(sentence);
                current_len = current.iter().map(|s| s.chars().count()).sum();
            } else {
                current.push(sentence);
                current_len += sentence_len;
            }
        }

        if !current.is_empty() && current_len >= self.min_chunk_size {
            let chunk_text = current.join(" ");
            let end_char = start_char + chunk_text.chars().count();
            chunks.push(self.make_chunk(
                &chunk_text,
                source_file,
                chunk_index,
                start_char,
                end_char,
            ));
        }

        debug!("Generated {} chunks from {}", chunks.len(), source_file);
        Ok(chunks)
    }

    fn make_chunk(
        &self,
        text: &str,
        source_file: &str,
        chunk_index: usize,
        start_char: usize,
        end_char: usize,
    ) -> DocumentChunk {
        let mut metadata = HashMap::new();
        metadata.insert(
            "word_count".to_string(),
            serde_json::json!(text.split_whitespace().count()),
        );
        metadata.insert(
            "char_count".to_string(),
            serde_json::json!(text.chars().count()),
        );

        DocumentChunk {
            chunk_id: Uuid::new_v4(),
            text: text.to_string(),
            source_file: source_file.to_string(),
            chunk_index,
            start_char,
            end_char,
            metadata,
        }
    }

    /// Cumulative metrics snapshot
    pub fn metrics(&self) -> ProcessingMetrics {
        let metrics = self.metrics.lock().unwrap();
        let mut snapshot = metrics.clone();
        let keep = snapshot.errors.len().saturating_sub(10);
        snapshot.errors.drain(..keep);
        snapshot
    }

    /// Health probe with configuration and counters
    pub fn health_check(&self) -> serde_json::Value {
        let metrics = self.metrics();
        serde_json::json!({
            "status": "healthy",
            "supported_formats": [".txt", ".csv", ".md"],
            "metrics": metrics,
            "configuration": {
                "max_chunk_size": self.config.chunk_size,
                "chunk_overlap": self.config.chunk_overlap,
                "min_chunk_size": self.min_chunk_size,
            }
        })
    }
}

/// Decode bytes as UTF-8, falling back through the legacy single-byte ladder
fn decode_text(bytes: &[u8]) -> Result<(String, &'static str)> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok((text.to_string(), "utf-8"));
    }
    // latin-1 maps every byte, so the ladder terminates here
    Ok((
        encoding_rs::mem::decode_latin1(bytes).into_owned(),
        "latin-1",
    ))
}

/// Strip Markdown syntax down to plain text
fn strip_markdown(content: &str) -> String {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    static INLINE: OnceLock<Regex> = OnceLock::new();
    static HEADER: OnceLock<Regex> = OnceLock::new();
    static BOLD: OnceLock<Regex> = OnceLock::new();
    static ITALIC: OnceLock<Regex> = OnceLock::new();
    static IMAGE: OnceLock<Regex> = OnceLock::new();
    static LINK: OnceLock<Regex> = OnceLock::new();

    let fenced = FENCED.get_or_init(|| Regex::new(r"(?s)```.*?```").unwrap());
    let inline = INLINE.get_or_init(|| Regex::new(r"`([^`]+)`").unwrap());
    let header = HEADER.get_or_init(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
    let bold = BOLD.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
    let italic = ITALIC.get_or_init(|| Regex::new(r"\*([^*]+)\*").unwrap());
    let image = IMAGE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\([^)]+\)").unwrap());
    let link = LINK.get_or_init(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());

    let content = fenced.replace_all(content, "");
    let content = inline.replace_all(&content, "$1");
    let content = header.replace_all(&content, "");
    let content = bold.replace_all(&content, "$1");
    let content = italic.replace_all(&content, "$1");
    // Images before links: the image syntax contains the link syntax
    let content = image.replace_all(&content, "");
    let content = link.replace_all(&content, "$1");

    blank_lines_re()
        .replace_all(&content, "\n\n")
        .trim()
        .to_string()
}

/// Render CSV as labeled text rows with a column preamble
fn render_csv(content: &str) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut records = reader.records();
    let header: Vec<String> = match records.next() {
        Some(record) => record
            .map_err(|e| RagError::InvalidInput(format!("CSV parse failed: {e}")))?
            .iter()
            .map(|cell| cell.trim().to_string())
            .collect(),
        None => return Ok(String::new()),
    };

    if header.is_empty() {
        return Ok(String::new());
    }

    let mut lines = Vec::new();
    lines.push("CSV Document".to_string());
    lines.push("=".repeat(50));
    lines.push(format!("Columns: {}", header.join(", ")));
    lines.push(String::new());

    let mut row_number = 0usize;
    for record in records {
        let record = record.map_err(|e| RagError::InvalidInput(format!("CSV parse failed: {e}")))?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        row_number += 1;

        let cells: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(j, cell)| match header.get(j) {
                Some(label) if !label.is_empty() => format!("{}={}", label, cell.trim()),
                _ => format!("column_{}={}", j + 1, cell.trim()),
            })
            .collect();

        lines.push(format!("Row {}: {}", row_number, cells.join(", ")));
    }

    Ok(lines.join("\n"))
}

/// Collapse whitespace, strip control characters and trim
fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = whitespace_re().replace_all(text, " ");
    let text: String = text
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect();
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = blank_lines_re().replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Split on sentence boundaries: punctuation, whitespace, then an uppercase
/// letter starts the next sentence. Sentences shorter than 10 characters are
/// dropped.
fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j].is_ascii_uppercase() {
                sentences.push(&text[start..=i]);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| s.chars().count() >= 10)
        .collect()
}

/// Whole sentences from the tail totaling at most `overlap` characters
fn overlap_suffix<'a>(sentences: &[&'a str], overlap: usize) -> Vec<&'a str> {
    if sentences.is_empty() || overlap == 0 {
        return Vec::new();
    }

    let mut selected: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for sentence in sentences.iter().rev() {
        let joined =
            total + sentence.chars().count() + if selected.is_empty() { 0 } else { 1 };
        if joined <= overlap {
            selected.insert(0, sentence);
            total = joined;
        } else {
            break;
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> DocumentProcessor {
        DocumentProcessor::new(DocumentConfig::default())
    }

    fn small_processor(chunk_size: usize, overlap: usize) -> DocumentProcessor {
        DocumentProcessor::new(DocumentConfig {
            max_file_size_mb: 50,
            chunk_size,
            chunk_overlap: overlap,
            max_chunks_per_document: 1000,
        })
    }

    #[test]
    fn test_unsupported_extension() {
        let result = processor().process_bytes(b"data", "file.pdf");
        assert!(matches!(result, Err(RagError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_oversize_rejected() {
        let p = DocumentProcessor::new(DocumentConfig {
            max_file_size_mb: 0,
            ..DocumentConfig::default()
        });
        let result = p.process_bytes(b"some content", "a.txt");
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
    }

    #[test]
    fn test_txt_roundtrip() {
        let text = "The quick brown fox jumps over the lazy dog. Pack my box with five dozen liquor jugs.";
        let (chunks, meta) = processor().process_bytes(text.as_bytes(), "t.txt").unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(meta.file_type, ".txt");
        assert_eq!(meta.encoding, "utf-8");
        assert!(chunks[0].text.contains("quick brown fox"));
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks[0].end_char, chunks[0].text.chars().count());
    }

    #[test]
    fn test_latin1_fallback() {
        // 0xE9 is 'é' in latin-1 and invalid standalone UTF-8
        let bytes = b"Caf\xe9 conversations are always pleasant here. Nobody disagrees with that sentiment.";
        let p = small_processor(200, 40);
        let (chunks, meta) = p.process_bytes(bytes, "t.txt").unwrap();

        assert_eq!(meta.encoding, "latin-1");

        // Offsets count characters, not UTF-8 bytes
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks[0].end_char, chunks[0].text.chars().count());
        assert!(chunks[0].end_char < chunks[0].text.len());
        assert_eq!(
            chunks[0].metadata["char_count"],
            serde_json::json!(chunks[0].text.chars().count())
        );
    }

    #[test]
    fn test_markdown_stripping() {
        let md = "# Test\n\nSome `inline` text with **bold** claims. \
                  ```rust\nfn hidden() {}\n```\nA [link](http://example.com) survives here. \
                  ![alt](img.png) Images vanish from the output entirely.";
        let (chunks, _) = processor().process_bytes(md.as_bytes(), "t.md").unwrap();

        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(!joined.contains("fn hidden"));
        assert!(!joined.contains('#'));
        assert!(!joined.contains("**"));
        assert!(joined.contains("link survives here"));
        assert!(!joined.contains("img.png"));
    }

    #[test]
    fn test_csv_rendering() {
        let csv = "Name,Age\nAlice,30\nBob,25";
        let rendered = render_csv(csv).unwrap();

        assert!(rendered.contains("Columns: Name, Age"));
        assert!(rendered.contains("Row 1: Name=Alice, Age=30"));
        assert!(rendered.contains("Row 2: Name=Bob, Age=25"));
    }

    #[test]
    fn test_csv_skips_empty_rows() {
        let csv = "A,B\n1,2\n,\n3,4";
        let rendered = render_csv(csv).unwrap();
        assert!(rendered.contains("Row 1: A=1, B=2"));
        assert!(rendered.contains("Row 2: A=3, B=4"));
        assert!(!rendered.contains("Row 3"));
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        let normalized = normalize_text("hello   world\t\tagain");
        assert_eq!(normalized, "hello world again");
    }

    #[test]
    fn test_sentence_split_boundaries() {
        let text = "This is the first sentence. This is the second one! Is this the third sentence? Yes it is indeed.";
        let sentences = split_sentences(text);
        assert_eq!(sentences.len(), 4);
        assert!(sentences[0].ends_with('.'));
        assert!(sentences[1].ends_with('!'));
    }

    #[test]
    fn test_sentence_split_no_break_on_lowercase() {
        let text = "Version 2.5 shipped with many improvements. the lowercase start stays attached.";
        let sentences = split_sentences(text);
        // "2.5 shipped" and ". the" are not boundaries
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn test_short_sentences_dropped() {
        let sentences = split_sentences("Go now. This sentence is long enough to keep.");
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn test_chunking_respects_size_and_overlap() {
        let mut text = String::new();
        for i in 0..20 {
            text.push_str(&format!(
                "Sentence number {i} carries enough characters to matter. "
            ));
        }

        let p = small_processor(200, 60);
        let (chunks, _) = p.process_bytes(text.as_bytes(), "t.txt").unwrap();

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 200 + 60);
        }
        for pair in chunks.windows(2) {
            assert!(pair[1].start_char >= pair[0].end_char.saturating_sub(60));
            assert!(pair[1].start_char <= pair[0].end_char);
            assert!(pair[0].start_char < pair[1].start_char);
        }
    }

    #[test]
    fn test_final_chunk_minimum() {
        // One long sentence then one short tail below max/4
        let text = "This opening sentence is made deliberately long so that it fills the chunk almost completely by itself and forces a flush. Tiny tail here.";
        let p = small_processor(120, 0);
        let (chunks, _) = p.process_bytes(text.as_bytes(), "t.txt").unwrap();

        // The 15-char tail is below the 30-char minimum and is dropped
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_max_chunks_enforced() {
        let mut text = String::new();
        for i in 0..50 {
            text.push_str(&format!(
                "Sentence number {i} carries enough characters to matter. "
            ));
        }

        let p = DocumentProcessor::new(DocumentConfig {
            max_file_size_mb: 50,
            chunk_size: 60,
            chunk_overlap: 0,
            max_chunks_per_document: 3,
        });
        let result = p.process_bytes(text.as_bytes(), "t.txt");
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
    }

    #[test]
    fn test_overlap_suffix_whole_sentences() {
        let sentences = vec!["First sentence here.", "Second sentence here.", "Third."];
        let overlap = overlap_suffix(&sentences, 30);
        assert_eq!(overlap, vec!["Second sentence here.", "Third."]);

        let none = overlap_suffix(&sentences, 0);
        assert!(none.is_empty());
    }

    #[test]
    fn test_content_hash_stable() {
        let (_, meta1) = processor()
            .process_bytes(b"Stable bytes yield stable hashes every time.", "a.txt")
            .unwrap();
        let (_, meta2) = processor()
            .process_bytes(b"Stable bytes yield stable hashes every time.", "b.txt")
            .unwrap();
        assert_eq!(meta1.content_hash, meta2.content_hash);
    }
}
