//! Self-hosted Retrieval-Augmented Generation service
//!
//! `ragd` turns a directory of documents into a question-answering service:
//! - Multi-format ingestion (txt, md, csv) with semantic chunking
//! - Qdrant-backed vector search with an in-memory fallback
//! - Grounded answer generation over Ollama or an in-process GGUF model
//! - Token streaming with connection tracking and idle reaping
//! - A service factory with health monitoring and auto-recovery
//!
//! # Example
//!
//! ```rust,no_run
//! use ragd::{RagConfig, ServiceFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RagConfig::default();
//!     let factory = ServiceFactory::initialize(config).await;
//!
//!     let ingest = factory.ingest().expect("ingestion unavailable");
//!     let doc_id = ingest
//!         .start_ingest("notes.txt", b"Rust is a systems language.".to_vec())
//!         .await?;
//!     println!("ingesting {doc_id}");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod factory;
pub mod health;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod processor;
pub mod prompt;
pub mod store;
pub mod streams;

// Re-export main types
pub use cache::{CacheStats, EmbeddingCache};
pub use config::{
    CacheConfig, DatabaseConfig, DocumentConfig, IngestConfig, ModelConfig, MonitorConfig,
    QueryConfig, RagConfig, StorageConfig, StoreTuning,
};
pub use embedding::EmbeddingService;
pub use error::{LlmError, RagError, Result, StoreError};
pub use factory::{ServiceFactory, ServiceInfo, ServiceStatus};
pub use health::{HealthAlert, HealthMonitor};
pub use ingest::{IngestionCoordinator, ProcessingStep, UploadProgress, UploadStatus};
pub use llm::{GenerationOptions, LlmClient, LlmProvider, LlmResponse, LlmService};
pub use pipeline::{RagContext, RagMetrics, RagPipeline, RagQuery, RagResponse, RagStatus};
pub use processor::{DocumentChunk, DocumentMetadata, DocumentProcessor};
pub use prompt::{PromptEngine, QueryType, ResponseFormat, SafetyLevel, ValidationStatus};
pub use store::{
    AlertSeverity, BatchResult, CollectionStats, DocumentSummary, PerformanceAlert, SearchFilters,
    SearchResult, StoredChunk, VectorStore,
};
pub use streams::{ConnectionStatus, StreamConnection, StreamEvent, StreamRegistry};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
