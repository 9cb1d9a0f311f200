//! Ingestion coordinator
//!
//! Drives one upload from raw bytes to stored vectors behind a per-document
//! progress record: PENDING → UPLOAD → VALIDATION → PARSING → CHUNKING →
//! EMBEDDING → STORAGE → COMPLETED, or FAILED with a message. Step index
//! and progress percentage never decrease. Uploads run concurrently up to a
//! configured limit; finished records are garbage collected after a
//! retention window.

use crate::config::{IngestConfig, StorageConfig, HARD_MAX_FILE_SIZE};
use crate::embedding::EmbeddingService;
use crate::error::{RagError, Result};
use crate::processor::DocumentProcessor;
use crate::store::{StoredChunk, VectorStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SUSPICIOUS_EXTENSIONS: [&str; 8] =
    ["exe", "bat", "cmd", "com", "scr", "pif", "vbs", "js"];

/// Steps of the upload state machine, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStep {
    Pending,
    Upload,
    Validation,
    Parsing,
    Chunking,
    Embedding,
    Storage,
    Completed,
    Failed,
}

impl ProcessingStep {
    /// Ordinal used to enforce forward-only transitions
    pub fn index(&self) -> u8 {
        match self {
            ProcessingStep::Pending => 0,
            ProcessingStep::Upload => 1,
            ProcessingStep::Validation => 2,
            ProcessingStep::Parsing => 3,
            ProcessingStep::Chunking => 4,
            ProcessingStep::Embedding => 5,
            ProcessingStep::Storage => 6,
            ProcessingStep::Completed => 7,
            ProcessingStep::Failed => 8,
        }
    }
}

/// Overall upload status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-upload progress record
#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub document_id: Uuid,
    pub filename: String,
    pub file_size: usize,
    pub status: UploadStatus,
    pub progress: f32,
    pub current_step: ProcessingStep,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub estimated_time_remaining: Option<f64>,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Pre-upload validation outcome
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub estimated_processing_time: f64,
    pub supported_features: Vec<String>,
    pub file_extension: String,
}

/// File validation rules
pub struct FileValidator {
    max_file_size: u64,
}

impl FileValidator {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size: max_file_size.min(HARD_MAX_FILE_SIZE),
        }
    }

    /// Validate a file before ingestion
    pub fn validate(
        &self,
        filename: &str,
        file_size: u64,
        content_type: Option<&str>,
    ) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let extension = Path::new(filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        if file_size > self.max_file_size {
            errors.push(format!(
                "File size {} bytes exceeds maximum {} bytes",
                file_size, self.max_file_size
            ));
        }

        if !matches!(extension.as_str(), "txt" | "md" | "csv") {
            errors.push(format!("Unsupported file format: {extension}"));
        }

        if let Some(content_type) = content_type {
            let expected: &[&str] = match content_type {
                "text/plain" => &["txt", "md", "csv"],
                "text/markdown" => &["md", "markdown"],
                "text/csv" => &["csv"],
                _ => &[],
            };
            if !expected.contains(&extension.as_str()) {
                warnings.push(format!(
                    "Content type {content_type} doesn't match file extension {extension}"
                ));
            }
        }

        if self.is_potentially_malicious(filename, file_size) {
            errors.push("File appears to be potentially malicious".to_string());
        }

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            estimated_processing_time: Self::estimate_processing_time(file_size, &extension),
            supported_features: Self::supported_features(&extension),
            file_extension: extension,
        }
    }

    fn is_potentially_malicious(&self, filename: &str, file_size: u64) -> bool {
        let extension = Path::new(filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        if SUSPICIOUS_EXTENSIONS.contains(&extension.as_str()) {
            return true;
        }

        // Double extensions like report.pdf.exe
        if filename.matches('.').count() > 1 {
            return true;
        }

        if file_size > HARD_MAX_FILE_SIZE {
            return true;
        }

        false
    }

    fn estimate_processing_time(file_size: u64, extension: &str) -> f64 {
        let base_rate = 1024.0 * 1024.0;
        let multiplier = match extension {
            "txt" => 1.0,
            "md" => 1.2,
            "csv" => 1.5,
            _ => 1.5,
        };
        ((file_size as f64 / base_rate) * multiplier).min(300.0)
    }

    fn supported_features(extension: &str) -> Vec<String> {
        let mut features = vec![
            "text_extraction".to_string(),
            "chunking".to_string(),
            "embedding".to_string(),
        ];
        match extension {
            "txt" | "md" => features.push("markdown_rendering".to_string()),
            "csv" => features.push("table_parsing".to_string()),
            _ => {}
        }
        features
    }
}

/// Progress record store with monotonic updates
struct ProgressTracker {
    uploads: Mutex<HashMap<Uuid, UploadProgress>>,
}

impl ProgressTracker {
    fn new() -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
        }
    }

    fn create(&self, document_id: Uuid, filename: &str, file_size: usize) {
        let now = Utc::now();
        let progress = UploadProgress {
            document_id,
            filename: filename.to_string(),
            file_size,
            status: UploadStatus::Pending,
            progress: 0.0,
            current_step: ProcessingStep::Pending,
            start_time: now,
            last_update: now,
            estimated_time_remaining: None,
            error_message: None,
            metadata: HashMap::new(),
        };
        self.uploads.lock().unwrap().insert(document_id, progress);
    }

    /// Advance a record. Step index and progress never move backwards; a
    /// FAILED record stays failed.
    fn update(&self, document_id: Uuid, step: ProcessingStep, progress: f32) {
        let mut uploads = self.uploads.lock().unwrap();
        let Some(record) = uploads.get_mut(&document_id) else {
            return;
        };
        if record.status == UploadStatus::Failed {
            return;
        }

        if step.index() >= record.current_step.index() {
            record.current_step = step;
        }
        record.progress = record.progress.max(progress.min(100.0));
        record.last_update = Utc::now();

        record.status = if record.progress >= 100.0 {
            UploadStatus::Completed
        } else {
            UploadStatus::Processing
        };

        if record.progress > 0.0 && record.progress < 100.0 {
            let elapsed = (record.last_update - record.start_time)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            record.estimated_time_remaining =
                Some(elapsed * (100.0 - record.progress as f64) / record.progress as f64);
        } else if record.progress >= 100.0 {
            record.estimated_time_remaining = Some(0.0);
        }
    }

    fn fail(&self, document_id: Uuid, message: &str) {
        let mut uploads = self.uploads.lock().unwrap();
        if let Some(record) = uploads.get_mut(&document_id) {
            record.status = UploadStatus::Failed;
            record.current_step = ProcessingStep::Failed;
            record.error_message = Some(message.to_string());
            record.last_update = Utc::now();
            record.estimated_time_remaining = None;
        }
    }

    fn annotate(&self, document_id: Uuid, key: &str, value: serde_json::Value) {
        let mut uploads = self.uploads.lock().unwrap();
        if let Some(record) = uploads.get_mut(&document_id) {
            record.metadata.insert(key.to_string(), value);
        }
    }

    fn get(&self, document_id: Uuid) -> Option<UploadProgress> {
        self.uploads.lock().unwrap().get(&document_id).cloned()
    }

    fn cleanup_older_than(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut uploads = self.uploads.lock().unwrap();
        let before = uploads.len();
        uploads.retain(|_, record| record.last_update > cutoff);
        before - uploads.len()
    }
}

/// Drives document uploads through processing, embedding and storage
pub struct IngestionCoordinator {
    processor: Arc<DocumentProcessor>,
    embedder: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
    validator: FileValidator,
    tracker: Arc<ProgressTracker>,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    upload_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    retention: chrono::Duration,
    shutdown: CancellationToken,
}

impl IngestionCoordinator {
    pub fn new(
        processor: Arc<DocumentProcessor>,
        embedder: Arc<EmbeddingService>,
        store: Arc<VectorStore>,
        storage: &StorageConfig,
        ingest: &IngestConfig,
        max_file_size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor,
            embedder,
            store,
            validator: FileValidator::new(max_file_size),
            tracker: Arc::new(ProgressTracker::new()),
            cancellations: Mutex::new(HashMap::new()),
            upload_dir: PathBuf::from(&storage.upload_dir),
            semaphore: Arc::new(Semaphore::new(ingest.max_concurrent.max(1))),
            retention: chrono::Duration::hours(ingest.progress_retention_hours as i64),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the hourly progress-record reaper
    pub fn start_reaper(self: &Arc<Self>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let removed = coordinator.tracker.cleanup_older_than(coordinator.retention);
                if removed > 0 {
                    info!("Reaped {} expired upload records", removed);
                }
            }
        });
    }

    /// Validate a file without ingesting it
    pub fn validate(
        &self,
        filename: &str,
        file_size: u64,
        content_type: Option<&str>,
    ) -> ValidationReport {
        self.validator.validate(filename, file_size, content_type)
    }

    /// Accept an upload: validate, persist the bytes and schedule the
    /// background processing task. Returns the document id.
    pub async fn start_ingest(
        self: &Arc<Self>,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<Uuid> {
        let document_id = Uuid::new_v4();
        self.tracker.create(document_id, filename, bytes.len());
        self.tracker
            .update(document_id, ProcessingStep::Upload, 5.0);

        let report = self.validator.validate(filename, bytes.len() as u64, None);
        if !report.is_valid {
            let message = report.errors.join("; ");
            self.tracker.fail(document_id, &message);
            return Err(RagError::InvalidInput(message));
        }
        if !report.warnings.is_empty() {
            self.tracker.annotate(
                document_id,
                "validation_warnings",
                serde_json::json!(report.warnings),
            );
        }

        let stored_path = self.persist_upload(filename, &bytes).await?;
        debug!("Persisted upload to {}", stored_path.display());
        self.tracker
            .update(document_id, ProcessingStep::Validation, 10.0);

        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .unwrap()
            .insert(document_id, cancel.clone());

        let coordinator = self.clone();
        let filename = filename.to_string();
        tokio::spawn(async move {
            let _permit = match coordinator.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if let Err(e) = coordinator
                .process_upload(document_id, &filename, bytes, &cancel)
                .await
            {
                error!("Ingest of {} failed: {}", filename, e);
                coordinator.tracker.fail(document_id, &e.to_string());
            }

            coordinator.cancellations.lock().unwrap().remove(&document_id);
        });

        Ok(document_id)
    }

    async fn process_upload(
        &self,
        document_id: Uuid,
        filename: &str,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let check_cancel = || -> Result<()> {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                Err(RagError::Cancelled)
            } else {
                Ok(())
            }
        };

        check_cancel()?;
        self.tracker
            .update(document_id, ProcessingStep::Parsing, 20.0);

        let processor = self.processor.clone();
        let owned_name = filename.to_string();
        let (chunks, meta) =
            tokio::task::spawn_blocking(move || processor.process_bytes(&bytes, &owned_name))
                .await
                .map_err(|e| RagError::Internal(e.to_string()))??;

        self.tracker
            .update(document_id, ProcessingStep::Chunking, 40.0);
        self.tracker.annotate(
            document_id,
            "chunk_count",
            serde_json::json!(chunks.len()),
        );
        self.tracker.annotate(
            document_id,
            "content_hash",
            serde_json::json!(meta.content_hash),
        );

        if chunks.is_empty() {
            self.tracker
                .update(document_id, ProcessingStep::Completed, 100.0);
            warn!("No chunks produced for {}", filename);
            return Ok(());
        }

        check_cancel()?;
        self.tracker
            .update(document_id, ProcessingStep::Embedding, 60.0);

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.encode(&texts).await?;

        let stored: Vec<StoredChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(mut chunk, vector)| {
                chunk.metadata.insert(
                    "document_id".to_string(),
                    serde_json::json!(document_id.to_string()),
                );
                StoredChunk::from_document_chunk(chunk, vector)
            })
            .collect();

        check_cancel()?;
        self.tracker
            .update(document_id, ProcessingStep::Storage, 80.0);

        // Synchronous batch keeps progress truthful; partial stored state is
        // left in place on failure
        let result = self.store.upsert_batch(stored).await;
        if result.successful == 0 && result.total > 0 {
            return Err(RagError::Internal(format!(
                "Storage failed: {}",
                result.errors.join("; ")
            )));
        }

        self.tracker
            .update(document_id, ProcessingStep::Completed, 100.0);
        info!(
            "Ingested {}: {}/{} chunks stored",
            filename, result.successful, result.total
        );
        Ok(())
    }

    /// Write upload bytes under the upload directory, uniquifying the
    /// filename with `_1`, `_2`, … before the extension on collision
    async fn persist_upload(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;

        let base = Path::new(filename);
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("upload");
        let extension = base.extension().and_then(|s| s.to_str());

        let mut candidate = self.upload_dir.join(filename);
        let mut counter = 1;
        while candidate.exists() {
            let name = match extension {
                Some(ext) => format!("{stem}_{counter}.{ext}"),
                None => format!("{stem}_{counter}"),
            };
            candidate = self.upload_dir.join(name);
            counter += 1;
        }

        tokio::fs::write(&candidate, bytes).await?;
        Ok(candidate)
    }

    /// Fetch the progress record for a document
    pub fn get_progress(&self, document_id: Uuid) -> Result<UploadProgress> {
        self.tracker
            .get(document_id)
            .ok_or_else(|| RagError::NotFound(format!("Upload {document_id}")))
    }

    /// Cancel an in-flight ingest; the record transitions to FAILED
    pub fn cancel_ingest(&self, document_id: Uuid) -> Result<()> {
        let cancellations = self.cancellations.lock().unwrap();
        match cancellations.get(&document_id) {
            Some(token) => {
                token.cancel();
                self.tracker.fail(document_id, "cancelled");
                Ok(())
            }
            None => Err(RagError::NotFound(format!("Upload {document_id}"))),
        }
    }

    /// Delete a document's chunks and its persisted upload file(s)
    pub async fn delete_document(&self, source_file: &str) -> Result<usize> {
        let deleted = self.store.delete_by_source(source_file).await?;

        let base = Path::new(source_file);
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let extension = base.extension().and_then(|s| s.to_str()).unwrap_or("");

        if let Ok(mut entries) = tokio::fs::read_dir(&self.upload_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let matches_stem =
                    name.starts_with(stem) && name.ends_with(extension) && !stem.is_empty();
                if matches_stem {
                    if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                        warn!("Could not remove upload file {}: {}", name, e);
                    }
                }
            }
        }

        Ok(deleted)
    }

    /// Drop expired progress records now; returns the number removed
    pub fn cleanup_expired(&self) -> usize {
        self.tracker.cleanup_older_than(self.retention)
    }

    /// Health probe
    pub fn health_check(&self) -> serde_json::Value {
        let uploads = self.tracker.uploads.lock().unwrap();
        let active = uploads
            .values()
            .filter(|u| u.status == UploadStatus::Processing)
            .count();
        serde_json::json!({
            "status": "healthy",
            "tracked_uploads": uploads.len(),
            "active_uploads": active,
            "available_slots": self.semaphore.available_permits(),
        })
    }

    /// Stop background work
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ordering() {
        assert!(ProcessingStep::Pending.index() < ProcessingStep::Upload.index());
        assert!(ProcessingStep::Embedding.index() < ProcessingStep::Storage.index());
        assert!(ProcessingStep::Storage.index() < ProcessingStep::Completed.index());
    }

    #[test]
    fn test_validator_accepts_supported() {
        let v = FileValidator::new(50 * 1024 * 1024);
        let report = v.validate("notes.txt", 1024, Some("text/plain"));
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
        assert_eq!(report.file_extension, "txt");
    }

    #[test]
    fn test_validator_rejects_unsupported_extension() {
        let v = FileValidator::new(50 * 1024 * 1024);
        let report = v.validate("binary.pdf", 1024, None);
        assert!(!report.is_valid);
    }

    #[test]
    fn test_validator_rejects_oversize() {
        let v = FileValidator::new(1024);
        let report = v.validate("big.txt", 2048, None);
        assert!(!report.is_valid);
    }

    #[test]
    fn test_validator_flags_double_extension() {
        let v = FileValidator::new(50 * 1024 * 1024);
        let report = v.validate("report.pdf.txt", 1024, None);
        assert!(!report.is_valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("potentially malicious")));
    }

    #[test]
    fn test_validator_mime_mismatch_is_warning() {
        let v = FileValidator::new(50 * 1024 * 1024);
        let report = v.validate("data.csv", 1024, Some("text/markdown"));
        assert!(report.is_valid);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_hard_cap_is_always_enforced() {
        let v = FileValidator::new(u64::MAX);
        let report = v.validate("huge.txt", HARD_MAX_FILE_SIZE + 1, None);
        assert!(!report.is_valid);
    }

    #[test]
    fn test_progress_monotonic() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.create(id, "a.txt", 100);

        tracker.update(id, ProcessingStep::Embedding, 60.0);
        let record = tracker.get(id).unwrap();
        assert_eq!(record.current_step, ProcessingStep::Embedding);
        assert_eq!(record.progress, 60.0);

        // Attempts to move backwards are ignored
        tracker.update(id, ProcessingStep::Parsing, 20.0);
        let record = tracker.get(id).unwrap();
        assert_eq!(record.current_step, ProcessingStep::Embedding);
        assert_eq!(record.progress, 60.0);
    }

    #[test]
    fn test_progress_eta() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.create(id, "a.txt", 100);

        tracker.update(id, ProcessingStep::Parsing, 20.0);
        let record = tracker.get(id).unwrap();
        assert!(record.estimated_time_remaining.is_some());

        tracker.update(id, ProcessingStep::Completed, 100.0);
        let record = tracker.get(id).unwrap();
        assert_eq!(record.estimated_time_remaining, Some(0.0));
        assert_eq!(record.status, UploadStatus::Completed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.create(id, "a.txt", 100);

        tracker.fail(id, "disk full");
        tracker.update(id, ProcessingStep::Completed, 100.0);

        let record = tracker.get(id).unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert_eq!(record.current_step, ProcessingStep::Failed);
        assert_eq!(record.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_cleanup_retention() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.create(id, "a.txt", 100);

        // Nothing is older than a day
        assert_eq!(tracker.cleanup_older_than(chrono::Duration::hours(24)), 0);
        // Everything is older than "zero seconds ago"
        assert_eq!(
            tracker.cleanup_older_than(chrono::Duration::seconds(-1)),
            1
        );
        assert!(tracker.get(id).is_none());
    }
}
