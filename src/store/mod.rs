//! Vector store layer
//!
//! One collection of chunk vectors behind a facade that routes to Qdrant
//! when reachable and to an in-process map otherwise. Includes a bounded
//! priority queue for asynchronous batch operations and a monitor that
//! tracks timings, error rates and memory, publishing alerts on a bus.
//!
//! Once the store has fallen back to memory it stays there; buffered state
//! is not replayed into the external database. Health reporting carries the
//! `fallback_mode` flag so callers can see the degradation.

mod memory;
mod monitor;
mod qdrant;
mod queue;

pub use memory::MemoryBackend;
pub use monitor::{AlertSeverity, MemorySample, OpPercentiles, PerformanceAlert, StoreMonitor};
pub use qdrant::QdrantBackend;
pub use queue::{OperationQueue, QueueOperation};

use crate::config::{DatabaseConfig, StoreTuning};
use crate::error::{RagError, Result};
use crate::processor::DocumentChunk;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A chunk as stored in the collection
#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub id: Uuid,
    pub text: String,
    pub vector: Vec<f32>,
    pub source_file: String,
    pub chunk_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredChunk {
    /// Pair a processed chunk with its embedding
    pub fn from_document_chunk(chunk: DocumentChunk, vector: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: chunk.chunk_id,
            text: chunk.text,
            vector,
            source_file: chunk.source_file,
            chunk_index: chunk.chunk_index,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            metadata: chunk.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One similarity search hit
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: Uuid,
    pub text: String,
    pub score: f32,
    pub source_file: String,
    pub chunk_index: usize,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Metadata filters; all present conditions combine with AND
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub source_file: Option<String>,
    pub source_files: Option<Vec<String>>,
    pub chunk_index: Option<usize>,
    pub chunk_index_min: Option<usize>,
    pub chunk_index_max: Option<usize>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.source_file.is_none()
            && self.source_files.is_none()
            && self.chunk_index.is_none()
            && self.chunk_index_min.is_none()
            && self.chunk_index_max.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
            && self.metadata.is_empty()
    }
}

/// Outcome of a batch operation
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub processing_time: f64,
    pub memory_usage_mb: f64,
}

/// Collection-level statistics
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub total_points: usize,
    pub total_vectors: usize,
    pub approx_size_bytes: usize,
    pub source_files: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Per-source grouping of stored chunks
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub source_file: String,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Storage backend contract shared by Qdrant and the in-memory fallback
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn upsert(&self, chunks: &[StoredChunk]) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<StoredChunk>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn delete_by_source(&self, source_file: &str) -> Result<usize>;
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>>;
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DocumentSummary>>;
    async fn stats(&self) -> Result<CollectionStats>;
    async fn clear(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

struct StoreCore {
    qdrant: Option<Arc<QdrantBackend>>,
    memory: Arc<MemoryBackend>,
    fallback: AtomicBool,
    dimension: usize,
    tuning: StoreTuning,
    monitor: Arc<StoreMonitor>,
}

impl StoreCore {
    fn active_backend(&self) -> Arc<dyn StoreBackend> {
        if self.fallback.load(Ordering::SeqCst) {
            return self.memory.clone();
        }
        match &self.qdrant {
            Some(qdrant) => qdrant.clone(),
            None => self.memory.clone(),
        }
    }

    fn in_fallback(&self) -> bool {
        self.fallback.load(Ordering::SeqCst) || self.qdrant.is_none()
    }

    /// After a primary-backend failure, decide whether to switch to the
    /// fallback. Switches (and returns true) when the external database no
    /// longer answers its ping.
    async fn should_fail_over(&self, error: &RagError) -> bool {
        if self.in_fallback() {
            return false;
        }
        let Some(qdrant) = &self.qdrant else {
            return false;
        };
        if qdrant.ping().await.is_ok() {
            return false;
        }

        warn!(
            "Vector database unreachable ({}), switching to in-memory fallback",
            error
        );
        self.fallback.store(true, Ordering::SeqCst);
        self.monitor.emit(
            "fallback_mode",
            "Vector database unreachable, operating on in-memory storage".to_string(),
            AlertSeverity::Critical,
            serde_json::Value::Null,
        );
        true
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::InvalidInput(format!(
                "Vector dimension {} does not match collection dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    async fn upsert_batch(&self, chunks: Vec<StoredChunk>) -> BatchResult {
        let start = Instant::now();
        let total = chunks.len();
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut errors = Vec::new();

        for chunk in &chunks {
            if let Err(e) = self.check_dimension(&chunk.vector) {
                return BatchResult {
                    total,
                    successful: 0,
                    failed: total,
                    errors: vec![e.to_string()],
                    processing_time: start.elapsed().as_secs_f64(),
                    memory_usage_mb: self.monitor.last_memory_mb(),
                };
            }
        }

        for (index, group) in chunks.chunks(self.tuning.batch_chunk_size.max(1)).enumerate() {
            let backend = self.active_backend();
            let result = match backend.upsert(group).await {
                Err(e) if self.should_fail_over(&e).await => self.memory.upsert(group).await,
                other => other,
            };

            match result {
                Ok(()) => successful += group.len(),
                Err(e) => {
                    failed += group.len();
                    errors.push(format!("Chunk group {}: {}", index + 1, e));
                    self.monitor.record_error("upsert_batch");
                }
            }
        }

        self.monitor.track_op("upsert_batch", start);
        debug!(
            "Batch upsert finished: {}/{} in {:.3}s",
            successful,
            total,
            start.elapsed().as_secs_f64()
        );

        BatchResult {
            total,
            successful,
            failed,
            errors,
            processing_time: start.elapsed().as_secs_f64(),
            memory_usage_mb: self.monitor.last_memory_mb(),
        }
    }

    async fn delete_batch(&self, ids: Vec<Uuid>) -> BatchResult {
        let start = Instant::now();
        let total = ids.len();
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut errors = Vec::new();

        for id in ids {
            let backend = self.active_backend();
            let result = match backend.delete(id).await {
                Err(e) if self.should_fail_over(&e).await => self.memory.delete(id).await,
                other => other,
            };
            match result {
                Ok(()) => successful += 1,
                Err(e) => {
                    failed += 1;
                    errors.push(format!("{id}: {e}"));
                    self.monitor.record_error("batch_delete");
                }
            }
        }

        self.monitor.track_op("batch_delete", start);
        BatchResult {
            total,
            successful,
            failed,
            errors,
            processing_time: start.elapsed().as_secs_f64(),
            memory_usage_mb: self.monitor.last_memory_mb(),
        }
    }

    async fn execute(&self, op: QueueOperation) -> BatchResult {
        match op {
            QueueOperation::BatchInsert(chunks) => self.upsert_batch(chunks).await,
            QueueOperation::BatchDelete(ids) => self.delete_batch(ids).await,
            QueueOperation::CollectionCleanup => {
                let start = Instant::now();
                let (rss_mb, _) = self.monitor.sample_memory();
                BatchResult {
                    total: 0,
                    successful: 0,
                    failed: 0,
                    errors: Vec::new(),
                    processing_time: start.elapsed().as_secs_f64(),
                    memory_usage_mb: rss_mb,
                }
            }
        }
    }
}

/// Vector store facade
pub struct VectorStore {
    core: Arc<StoreCore>,
    queue: Arc<OperationQueue>,
    shutdown: CancellationToken,
}

impl VectorStore {
    /// Connect to the external database, dropping into fallback mode when it
    /// is unreachable. Starts the queue worker and the memory sampler.
    pub async fn connect(config: &DatabaseConfig, tuning: StoreTuning) -> Self {
        let monitor = Arc::new(StoreMonitor::new(tuning.clone()));

        let qdrant = match QdrantBackend::connect(config).await {
            Ok(backend) => Some(Arc::new(backend)),
            Err(e) => {
                warn!(
                    "Vector database unavailable at startup ({}), using in-memory fallback",
                    e
                );
                monitor.emit(
                    "fallback_mode",
                    "Vector database unavailable at startup".to_string(),
                    AlertSeverity::High,
                    serde_json::Value::Null,
                );
                None
            }
        };

        let fallback = qdrant.is_none();
        let core = Arc::new(StoreCore {
            qdrant,
            memory: Arc::new(MemoryBackend::new(config.vector_size)),
            fallback: AtomicBool::new(fallback),
            dimension: config.vector_size,
            tuning: tuning.clone(),
            monitor,
        });

        let queue = Arc::new(OperationQueue::new(tuning.max_queue_size));
        let shutdown = CancellationToken::new();

        let store = Self {
            core: core.clone(),
            queue: queue.clone(),
            shutdown: shutdown.clone(),
        };

        // Queue worker
        {
            let core = core.clone();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let signals = queue.signal_receiver();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = signals.recv_async() => {
                            if received.is_err() {
                                break;
                            }
                        }
                    }
                    while let Some(item) = queue.pop() {
                        let result = core.execute(item.op).await;
                        if let Some(reply) = item.reply {
                            let _ = reply.send(result);
                        }
                    }
                }
                debug!("Store queue worker stopped");
            });
        }

        // Memory sampler: every 30s, enqueue a cleanup when over threshold
        {
            let core = core.clone();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(30));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let (_, over) = core.monitor.sample_memory();
                    if over {
                        let _ = queue.enqueue(QueueOperation::CollectionCleanup, 1, None);
                    }
                    core.monitor.track_queue_depth(queue.depth());
                }
            });
        }

        info!(
            "Vector store ready (fallback_mode={})",
            store.is_fallback()
        );
        store
    }

    /// Whether the store is operating on the in-memory fallback
    pub fn is_fallback(&self) -> bool {
        self.core.in_fallback()
    }

    /// Upsert a single chunk; idempotent on id
    pub async fn upsert(&self, chunk: StoredChunk) -> Result<()> {
        self.core.check_dimension(&chunk.vector)?;
        let start = Instant::now();

        let backend = self.core.active_backend();
        let chunks = [chunk];
        let result = match backend.upsert(&chunks).await {
            Err(e) if self.core.should_fail_over(&e).await => {
                self.core.memory.upsert(&chunks).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.core.monitor.track_op("upsert", start);
                Ok(())
            }
            Err(e) => {
                self.core.monitor.record_error("upsert");
                Err(e)
            }
        }
    }

    /// Upsert many chunks, internally grouped; partial success permitted
    pub async fn upsert_batch(&self, chunks: Vec<StoredChunk>) -> BatchResult {
        self.core.upsert_batch(chunks).await
    }

    /// Fetch a chunk by id
    pub async fn get(&self, id: Uuid) -> Result<Option<StoredChunk>> {
        let start = Instant::now();
        let backend = self.core.active_backend();
        let result = match backend.get(id).await {
            Err(e) if self.core.should_fail_over(&e).await => self.core.memory.get(id).await,
            other => other,
        };

        match result {
            Ok(found) => {
                self.core.monitor.track_op("get", start);
                Ok(found)
            }
            Err(e) => {
                self.core.monitor.record_error("get");
                Err(e)
            }
        }
    }

    /// Delete a chunk by id; idempotent
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let start = Instant::now();
        let backend = self.core.active_backend();
        let result = match backend.delete(id).await {
            Err(e) if self.core.should_fail_over(&e).await => self.core.memory.delete(id).await,
            other => other,
        };

        match result {
            Ok(()) => {
                self.core.monitor.track_op("delete", start);
                Ok(())
            }
            Err(e) => {
                self.core.monitor.record_error("delete");
                Err(e)
            }
        }
    }

    /// Delete every chunk from one source file, returning the count removed
    pub async fn delete_by_source(&self, source_file: &str) -> Result<usize> {
        let start = Instant::now();
        let backend = self.core.active_backend();
        let result = match backend.delete_by_source(source_file).await {
            Err(e) if self.core.should_fail_over(&e).await => {
                self.core.memory.delete_by_source(source_file).await
            }
            other => other,
        };

        match result {
            Ok(count) => {
                self.core.monitor.track_op("delete_by_source", start);
                Ok(count)
            }
            Err(e) => {
                self.core.monitor.record_error("delete_by_source");
                Err(e)
            }
        }
    }

    /// Similarity search sorted by score descending, thresholded
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        self.core.check_dimension(query)?;
        let start = Instant::now();

        let backend = self.core.active_backend();
        let result = match backend.search(query, top_k, min_score, filters).await {
            Err(e) if self.core.should_fail_over(&e).await => {
                self.core.memory.search(query, top_k, min_score, filters).await
            }
            other => other,
        };

        match result {
            Ok(mut results) => {
                // Defensive: backends already rank, but the contract is ours
                results.retain(|r| r.score >= min_score);
                results.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                results.truncate(top_k);
                self.core.monitor.track_op("search", start);
                Ok(results)
            }
            Err(e) => {
                self.core.monitor.record_error("search");
                Err(e)
            }
        }
    }

    /// Search many query vectors, preserving query order
    pub async fn batch_search(
        &self,
        queries: &[Vec<f32>],
        top_k: usize,
        min_score: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<Vec<SearchResult>>> {
        let start = Instant::now();
        let mut all = Vec::with_capacity(queries.len());
        for query in queries {
            all.push(self.search(query, top_k, min_score, filters).await?);
        }
        self.core.monitor.track_op("batch_search", start);
        Ok(all)
    }

    /// List stored documents grouped by source file
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DocumentSummary>> {
        let start = Instant::now();
        let backend = self.core.active_backend();
        let result = match backend.list(limit, offset).await {
            Err(e) if self.core.should_fail_over(&e).await => {
                self.core.memory.list(limit, offset).await
            }
            other => other,
        };

        match result {
            Ok(summaries) => {
                self.core.monitor.track_op("list", start);
                Ok(summaries)
            }
            Err(e) => {
                self.core.monitor.record_error("list");
                Err(e)
            }
        }
    }

    /// Collection statistics
    pub async fn stats(&self) -> Result<CollectionStats> {
        let start = Instant::now();
        let backend = self.core.active_backend();
        let result = match backend.stats().await {
            Err(e) if self.core.should_fail_over(&e).await => self.core.memory.stats().await,
            other => other,
        };

        match result {
            Ok(stats) => {
                self.core.monitor.track_op("stats", start);
                Ok(stats)
            }
            Err(e) => {
                self.core.monitor.record_error("stats");
                Err(e)
            }
        }
    }

    /// Remove every point from the collection
    pub async fn clear(&self) -> Result<()> {
        let start = Instant::now();
        let backend = self.core.active_backend();
        let result = match backend.clear().await {
            Err(e) if self.core.should_fail_over(&e).await => self.core.memory.clear().await,
            other => other,
        };

        match result {
            Ok(()) => {
                self.core.monitor.track_op("clear", start);
                Ok(())
            }
            Err(e) => {
                self.core.monitor.record_error("clear");
                Err(e)
            }
        }
    }

    /// Queue a batch insert for background execution. The returned channel
    /// yields the batch outcome when the worker finishes the item.
    pub fn queue_batch_insert(
        &self,
        chunks: Vec<StoredChunk>,
        priority: u8,
    ) -> Result<flume::Receiver<BatchResult>> {
        let (tx, rx) = flume::bounded(1);
        self.enqueue(QueueOperation::BatchInsert(chunks), priority, Some(tx))?;
        Ok(rx)
    }

    /// Queue a batch delete for background execution
    pub fn queue_batch_delete(
        &self,
        ids: Vec<Uuid>,
        priority: u8,
    ) -> Result<flume::Receiver<BatchResult>> {
        let (tx, rx) = flume::bounded(1);
        self.enqueue(QueueOperation::BatchDelete(ids), priority, Some(tx))?;
        Ok(rx)
    }

    fn enqueue(
        &self,
        op: QueueOperation,
        priority: u8,
        reply: Option<flume::Sender<BatchResult>>,
    ) -> Result<()> {
        match self.queue.enqueue(op, priority, reply) {
            Ok(()) => {
                self.core.monitor.track_queue_depth(self.queue.depth());
                Ok(())
            }
            Err(e) => {
                self.core.monitor.emit(
                    "queue_full",
                    format!("Operation queue full: {} items", self.queue.depth()),
                    AlertSeverity::High,
                    serde_json::json!({ "queue_depth": self.queue.depth() }),
                );
                Err(e)
            }
        }
    }

    /// Current async queue depth
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Subscribe to performance alerts
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<PerformanceAlert> {
        self.core.monitor.subscribe()
    }

    /// Recent alerts, newest last
    pub fn recent_alerts(&self, limit: usize) -> Vec<PerformanceAlert> {
        self.core.monitor.recent_alerts(limit)
    }

    /// Health payload with fallback flag, success rate and recent alerts
    pub async fn health_status(&self) -> serde_json::Value {
        let (ok, failed) = self.core.monitor.totals();
        let total = ok + failed;
        let stats = self.stats().await.ok();

        let status = if failed as f64 / total.max(1) as f64 > 0.1 {
            "unhealthy"
        } else if self.is_fallback() {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "connected": !self.is_fallback(),
            "fallback_mode": self.is_fallback(),
            "vector_size": self.core.dimension,
            "uptime_secs": self.core.monitor.uptime_secs(),
            "total_operations": total,
            "failed_operations": failed,
            "success_rate": (total - failed) as f64 / total.max(1) as f64,
            "avg_operation_times": self.core.monitor.average_times(),
            "queue_depth": self.queue.depth(),
            "memory_mb": self.core.monitor.last_memory_mb(),
            "collection_stats": stats,
            "recent_alerts": self.recent_alerts(5),
        })
    }

    /// Detailed metrics: percentiles, error rates, queue utilization, memory
    pub fn detailed_metrics(&self) -> serde_json::Value {
        serde_json::json!({
            "operation_percentiles": self.core.monitor.percentiles(),
            "error_rates": self.core.monitor.error_rates(),
            "queue": {
                "depth": self.queue.depth(),
                "max_size": self.core.tuning.max_queue_size,
                "utilization": self.queue.depth() as f64
                    / self.core.tuning.max_queue_size.max(1) as f64,
            },
            "memory_trend": self.core.monitor.memory_trend(10),
            "uptime_secs": self.core.monitor.uptime_secs(),
        })
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::StoredChunk;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    pub fn chunk_with(source: &str, index: usize, vector: Vec<f32>) -> StoredChunk {
        let now = Utc::now();
        StoredChunk {
            id: Uuid::new_v4(),
            text: format!("chunk {index} of {source}"),
            vector,
            source_file: source.to_string(),
            chunk_index: index,
            start_char: index * 100,
            end_char: index * 100 + 50,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::chunk_with;
    use super::*;
    use crate::config::DatabaseConfig;

    /// Unreachable database URL forces fallback mode at startup
    async fn fallback_store() -> VectorStore {
        let config = DatabaseConfig {
            qdrant_url: "http://127.0.0.1:1".to_string(),
            vector_size: 4,
            ..DatabaseConfig::default()
        };
        VectorStore::connect(&config, StoreTuning::default()).await
    }

    #[tokio::test]
    async fn test_fallback_on_unreachable_database() {
        let store = fallback_store().await;
        assert!(store.is_fallback());

        let health = store.health_status().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["fallback_mode"], true);
    }

    #[tokio::test]
    async fn test_dimension_enforced() {
        let store = fallback_store().await;
        let chunk = chunk_with("a.txt", 0, vec![1.0, 0.0]);

        let result = store.upsert(chunk).await;
        assert!(matches!(result, Err(RagError::InvalidInput(_))));

        let result = store.search(&[1.0, 0.0], 5, 0.0, &SearchFilters::default()).await;
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_upsert_get_roundtrip() {
        let store = fallback_store().await;
        let chunk = chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]);
        let id = chunk.id;

        store.upsert(chunk.clone()).await.unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.text, chunk.text);

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_upsert_and_stats() {
        let store = fallback_store().await;
        let chunks = vec![
            chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
            chunk_with("a.txt", 1, vec![0.5, 0.5, 0.0, 0.0]),
            chunk_with("b.txt", 0, vec![0.0, 0.0, 1.0, 0.0]),
        ];

        let result = store.upsert_batch(chunks).await;
        assert_eq!(result.total, 3);
        assert_eq!(result.successful, 3);
        assert_eq!(result.failed, 0);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_points, 3);
        assert_eq!(stats.source_files.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_upsert_dimension_mismatch_rejected_whole() {
        let store = fallback_store().await;
        let chunks = vec![
            chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
            chunk_with("a.txt", 1, vec![0.5, 0.5]),
        ];

        let result = store.upsert_batch(chunks).await;
        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 2);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_search_ranked_and_thresholded() {
        let store = fallback_store().await;
        store
            .upsert_batch(vec![
                chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("a.txt", 1, vec![0.7, 0.7, 0.0, 0.0]),
                chunk_with("a.txt", 2, vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await;

        let results = store
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.5, &SearchFilters::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(results.iter().all(|r| r.score >= 0.5));
    }

    #[tokio::test]
    async fn test_batch_search_preserves_order() {
        let store = fallback_store().await;
        store
            .upsert_batch(vec![
                chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("b.txt", 0, vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await;

        let queries = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];
        let results = store
            .batch_search(&queries, 1, 0.5, &SearchFilters::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0][0].source_file, "a.txt");
        assert_eq!(results[1][0].source_file, "b.txt");
    }

    #[tokio::test]
    async fn test_queued_batch_insert_delivers_result() {
        let store = fallback_store().await;
        let chunks = vec![chunk_with("q.txt", 0, vec![1.0, 0.0, 0.0, 0.0])];

        let rx = store.queue_batch_insert(chunks, 2).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.successful, 1);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_points, 1);
    }

    #[tokio::test]
    async fn test_queue_backpressure_alert() {
        let config = DatabaseConfig {
            qdrant_url: "http://127.0.0.1:1".to_string(),
            vector_size: 4,
            ..DatabaseConfig::default()
        };
        let tuning = StoreTuning {
            max_queue_size: 1,
            ..StoreTuning::default()
        };
        let store = VectorStore::connect(&config, tuning).await;
        let mut alerts = store.subscribe_alerts();

        // Saturate the queue faster than the worker drains it
        let mut accepted = 0;
        let mut rejected = false;
        for _ in 0..50 {
            match store.queue_batch_insert(
                vec![chunk_with("q.txt", 0, vec![1.0, 0.0, 0.0, 0.0])],
                2,
            ) {
                Ok(_) => accepted += 1,
                Err(e) => {
                    assert!(matches!(
                        e,
                        RagError::Store(crate::error::StoreError::QueueFull)
                    ));
                    rejected = true;
                    break;
                }
            }
        }
        assert!(accepted >= 1);

        if rejected {
            let alert = loop {
                let alert = alerts.recv().await.unwrap();
                if alert.alert_type == "queue_full" {
                    break alert;
                }
            };
            assert_eq!(alert.severity, AlertSeverity::High);
        }
    }

    #[tokio::test]
    async fn test_clear_empties_collection() {
        let store = fallback_store().await;
        store
            .upsert_batch(vec![chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0])])
            .await;

        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap().total_points, 0);
    }
}
