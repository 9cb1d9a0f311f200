//! Service factory
//!
//! Owns the long-lived service singletons and their lifecycle: ordered
//! initialization with per-service isolation, status records, health
//! aggregation and targeted restarts. Components receive their
//! collaborators as handles at construction; nothing is fetched from
//! process globals.

use crate::config::RagConfig;
use crate::embedding::EmbeddingService;
use crate::ingest::IngestionCoordinator;
use crate::llm::LlmService;
use crate::pipeline::RagPipeline;
use crate::processor::DocumentProcessor;
use crate::store::VectorStore;
use crate::streams::StreamRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle state of one owned service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Initializing,
    Healthy,
    Unhealthy,
    Error,
    Disabled,
}

/// Status record for one owned service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    pub health_data: serde_json::Value,
    pub last_check: DateTime<Utc>,
    pub error_count: u32,
    pub initialization_secs: Option<f64>,
}

impl ServiceInfo {
    fn ready(name: &str, init_secs: f64) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Initializing,
            health_data: serde_json::Value::Null,
            last_check: Utc::now(),
            error_count: 0,
            initialization_secs: Some(init_secs),
        }
    }

    fn failed(name: &str, error: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Error,
            health_data: serde_json::json!({ "error": error }),
            last_check: Utc::now(),
            error_count: 1,
            initialization_secs: None,
        }
    }
}

/// Owner of the service singletons
pub struct ServiceFactory {
    config: RagConfig,
    embedding: RwLock<Option<Arc<EmbeddingService>>>,
    llm: RwLock<Option<Arc<LlmService>>>,
    processor: RwLock<Option<Arc<DocumentProcessor>>>,
    store: RwLock<Option<Arc<VectorStore>>>,
    pipeline: RwLock<Option<Arc<RagPipeline>>>,
    ingest: RwLock<Option<Arc<IngestionCoordinator>>>,
    streams: Arc<StreamRegistry>,
    services: RwLock<HashMap<String, ServiceInfo>>,
    started: Instant,
}

impl ServiceFactory {
    /// Initialize every owned service in dependency order. A failing
    /// service is recorded as ERROR and skipped; startup continues.
    pub async fn initialize(config: RagConfig) -> Arc<Self> {
        info!("Initializing services...");

        let streams = StreamRegistry::new(config.monitor.idle_stream_timeout_mins);
        streams.start_sweeper();

        let factory = Arc::new(Self {
            config,
            embedding: RwLock::new(None),
            llm: RwLock::new(None),
            processor: RwLock::new(None),
            store: RwLock::new(None),
            pipeline: RwLock::new(None),
            ingest: RwLock::new(None),
            streams,
            services: RwLock::new(HashMap::new()),
            started: Instant::now(),
        });

        factory.init_embedding().await;
        factory.init_llm().await;
        factory.init_processor();
        factory.init_store().await;
        factory.rebuild_pipeline();
        factory.rebuild_ingest();
        factory.record("streams", ServiceInfo::ready("streams", 0.0));

        info!("Service initialization completed");
        factory
    }

    fn record(&self, name: &str, info: ServiceInfo) {
        self.services
            .write()
            .unwrap()
            .insert(name.to_string(), info);
    }

    async fn init_embedding(&self) {
        let start = Instant::now();
        let built = tokio::time::timeout(
            INIT_TIMEOUT,
            EmbeddingService::with_cache(self.config.model.clone(), &self.config.database),
        )
        .await
        .unwrap_or_else(|_| Err(crate::error::RagError::Timeout));

        match built {
            Ok(service) => {
                *self.embedding.write().unwrap() = Some(Arc::new(service));
                self.record(
                    "embedding",
                    ServiceInfo::ready("embedding", start.elapsed().as_secs_f64()),
                );
                info!(
                    "Embedding service initialized in {:.2}s",
                    start.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                error!("Failed to initialize embedding service: {}", e);
                self.record("embedding", ServiceInfo::failed("embedding", &e.to_string()));
            }
        }
    }

    async fn init_llm(&self) {
        let start = Instant::now();
        let built = tokio::time::timeout(INIT_TIMEOUT, LlmService::initialize(&self.config.model))
            .await
            .unwrap_or_else(|_| Err(crate::error::RagError::Timeout));

        match built {
            Ok(service) => {
                *self.llm.write().unwrap() = Some(Arc::new(service));
                self.record("llm", ServiceInfo::ready("llm", start.elapsed().as_secs_f64()));
                info!(
                    "LLM service initialized in {:.2}s",
                    start.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                error!("Failed to initialize LLM service: {}", e);
                self.record("llm", ServiceInfo::failed("llm", &e.to_string()));
            }
        }
    }

    fn init_processor(&self) {
        let start = Instant::now();
        let processor = DocumentProcessor::new(self.config.document.clone());
        *self.processor.write().unwrap() = Some(Arc::new(processor));
        self.record(
            "document_processor",
            ServiceInfo::ready("document_processor", start.elapsed().as_secs_f64()),
        );
    }

    async fn init_store(&self) {
        let start = Instant::now();
        match tokio::time::timeout(
            INIT_TIMEOUT,
            VectorStore::connect(&self.config.database, self.config.store.clone()),
        )
        .await
        {
            Ok(store) => {
                *self.store.write().unwrap() = Some(Arc::new(store));
                self.record(
                    "vector_store",
                    ServiceInfo::ready("vector_store", start.elapsed().as_secs_f64()),
                );
                info!(
                    "Vector store initialized in {:.2}s",
                    start.elapsed().as_secs_f64()
                );
            }
            Err(_) => {
                error!("Vector store initialization timed out");
                self.record(
                    "vector_store",
                    ServiceInfo::failed("vector_store", "initialization timed out"),
                );
            }
        }
    }

    /// (Re)wire the pipeline from the current service handles
    fn rebuild_pipeline(&self) {
        let start = Instant::now();
        let embedding = self.embedding.read().unwrap().clone();
        let store = self.store.read().unwrap().clone();
        let llm = self.llm.read().unwrap().clone();

        match (embedding, store, llm) {
            (Some(embedding), Some(store), Some(llm)) => {
                let pipeline = RagPipeline::new(
                    embedding,
                    store,
                    llm,
                    Duration::from_secs(self.config.query.llm_timeout),
                );
                *self.pipeline.write().unwrap() = Some(Arc::new(pipeline));
                self.record(
                    "rag_pipeline",
                    ServiceInfo::ready("rag_pipeline", start.elapsed().as_secs_f64()),
                );
            }
            _ => {
                warn!("RAG pipeline not built: missing dependencies");
                self.record(
                    "rag_pipeline",
                    ServiceInfo::failed("rag_pipeline", "missing dependencies"),
                );
            }
        }
    }

    /// (Re)wire the ingestion coordinator from the current service handles
    fn rebuild_ingest(&self) {
        let start = Instant::now();
        let processor = self.processor.read().unwrap().clone();
        let embedding = self.embedding.read().unwrap().clone();
        let store = self.store.read().unwrap().clone();

        match (processor, embedding, store) {
            (Some(processor), Some(embedding), Some(store)) => {
                let coordinator = IngestionCoordinator::new(
                    processor,
                    embedding,
                    store,
                    &self.config.storage,
                    &self.config.ingest,
                    self.config.max_file_size_bytes(),
                );
                coordinator.start_reaper();
                *self.ingest.write().unwrap() = Some(coordinator);
                self.record(
                    "ingestion",
                    ServiceInfo::ready("ingestion", start.elapsed().as_secs_f64()),
                );
            }
            _ => {
                warn!("Ingestion coordinator not built: missing dependencies");
                self.record(
                    "ingestion",
                    ServiceInfo::failed("ingestion", "missing dependencies"),
                );
            }
        }
    }

    /// Service accessors; `None` when the service failed to initialize

    pub fn embedding(&self) -> Option<Arc<EmbeddingService>> {
        self.embedding.read().unwrap().clone()
    }

    pub fn llm(&self) -> Option<Arc<LlmService>> {
        self.llm.read().unwrap().clone()
    }

    pub fn processor(&self) -> Option<Arc<DocumentProcessor>> {
        self.processor.read().unwrap().clone()
    }

    pub fn store(&self) -> Option<Arc<VectorStore>> {
        self.store.read().unwrap().clone()
    }

    pub fn pipeline(&self) -> Option<Arc<RagPipeline>> {
        self.pipeline.read().unwrap().clone()
    }

    pub fn ingest(&self) -> Option<Arc<IngestionCoordinator>> {
        self.ingest.read().unwrap().clone()
    }

    pub fn streams(&self) -> Arc<StreamRegistry> {
        self.streams.clone()
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Status records for every owned service
    pub fn service_info(&self) -> HashMap<String, ServiceInfo> {
        self.services.read().unwrap().clone()
    }

    /// Probe every service and refresh its status record. Returns the
    /// aggregate report.
    pub async fn check_health(&self) -> serde_json::Value {
        if let Some(embedding) = self.embedding() {
            let health = embedding.health_check().await;
            self.apply_probe("embedding", health);
        }

        if let Some(llm) = self.llm() {
            let health = llm.health_check().await;
            self.apply_probe("llm", health);
        }

        if let Some(processor) = self.processor() {
            self.apply_probe("document_processor", processor.health_check());
        }

        if let Some(store) = self.store() {
            let health = store.health_status().await;
            self.apply_probe("vector_store", health);
        }

        if let Some(pipeline) = self.pipeline() {
            // Cheap readiness: never triggers initialization or downstream
            // calls
            self.apply_probe("rag_pipeline", pipeline.readiness());
        }

        if let Some(ingest) = self.ingest() {
            self.apply_probe("ingestion", ingest.health_check());
        }

        self.apply_probe(
            "streams",
            serde_json::json!({
                "status": "healthy",
                "active_connections": self.streams.len(),
            }),
        );

        self.aggregate_report()
    }

    fn apply_probe(&self, name: &str, health: serde_json::Value) {
        let status = match health.get("status").and_then(|s| s.as_str()) {
            Some("healthy") => ServiceStatus::Healthy,
            Some("degraded") | Some("unhealthy") => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Error,
        };

        let mut services = self.services.write().unwrap();
        let entry = services
            .entry(name.to_string())
            .or_insert_with(|| ServiceInfo::ready(name, 0.0));
        entry.status = status;
        entry.health_data = health;
        entry.last_check = Utc::now();
        if status != ServiceStatus::Healthy {
            entry.error_count += 1;
        }
    }

    fn aggregate_report(&self) -> serde_json::Value {
        let services = self.services.read().unwrap();

        let all_healthy = !services.is_empty()
            && services.values().all(|s| s.status == ServiceStatus::Healthy);
        let any_unhealthy = services
            .values()
            .any(|s| s.status == ServiceStatus::Unhealthy);

        let overall = if all_healthy {
            "healthy"
        } else if any_unhealthy {
            "degraded"
        } else {
            "unhealthy"
        };

        let healthy: Vec<&str> = services
            .values()
            .filter(|s| s.status == ServiceStatus::Healthy)
            .map(|s| s.name.as_str())
            .collect();

        serde_json::json!({
            "overall_status": overall,
            "services": *services,
            "healthy_services": healthy,
            "uptime_secs": self.started.elapsed().as_secs_f64(),
            "timestamp": Utc::now(),
        })
    }

    /// Dispose and re-initialize a single service, then rewire dependents
    pub async fn restart_service(&self, name: &str) -> bool {
        info!("Restarting service: {}", name);

        match name {
            "embedding" => {
                *self.embedding.write().unwrap() = None;
                self.init_embedding().await;
            }
            "llm" => {
                *self.llm.write().unwrap() = None;
                self.init_llm().await;
            }
            "document_processor" => {
                *self.processor.write().unwrap() = None;
                self.init_processor();
            }
            "vector_store" => {
                if let Some(store) = self.store.write().unwrap().take() {
                    store.shutdown();
                }
                self.init_store().await;
            }
            other => {
                error!("Unknown service for restart: {}", other);
                return false;
            }
        }

        self.rebuild_pipeline();
        self.rebuild_ingest();

        let restarted = matches!(
            self.services
                .read()
                .unwrap()
                .get(name)
                .map(|s| s.status),
            Some(ServiceStatus::Initializing) | Some(ServiceStatus::Healthy)
        );
        if restarted {
            info!("Service '{}' restarted", name);
        } else {
            error!("Service '{}' restart failed", name);
        }
        restarted
    }

    /// Stop background work owned by the factory's services
    pub fn shutdown(&self) {
        info!("Shutting down services...");
        if let Some(store) = self.store.read().unwrap().as_ref() {
            store.shutdown();
        }
        if let Some(ingest) = self.ingest.read().unwrap().as_ref() {
            ingest.shutdown();
        }
        self.streams.shutdown();
        info!("Service shutdown completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> RagConfig {
        let mut config = RagConfig::default();
        // Point every external dependency at unreachable addresses
        config.database.qdrant_url = "http://127.0.0.1:1".to_string();
        config.model.ollama_url = "http://127.0.0.1:1".to_string();
        config.database.cache.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_initialize_isolates_failures() {
        let factory = ServiceFactory::initialize(offline_config()).await;

        // Ollama is down, so the LLM service records an error but other
        // services come up
        let services = factory.service_info();
        assert_eq!(services["llm"].status, ServiceStatus::Error);
        assert!(factory.processor().is_some());
        assert!(factory.store().is_some());
        assert!(factory.embedding().is_some());

        // The pipeline needs the LLM and is therefore not built
        assert!(factory.pipeline().is_none());
        assert_eq!(services["rag_pipeline"].status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_health_aggregation_degraded_in_fallback() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        let report = factory.check_health().await;

        // The vector store is in fallback mode (degraded), so the overall
        // status is degraded rather than healthy
        assert_eq!(report["overall_status"], "degraded");
        let store_health = &report["services"]["vector_store"]["health_data"];
        assert_eq!(store_health["fallback_mode"], true);
    }

    #[tokio::test]
    async fn test_restart_unknown_service() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        assert!(!factory.restart_service("no_such_service").await);
    }

    #[tokio::test]
    async fn test_restart_document_processor() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        assert!(factory.restart_service("document_processor").await);
        assert!(factory.processor().is_some());
    }
}
