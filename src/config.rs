//! Configuration management for the RAG service

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the RAG service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagConfig {
    /// Vector database and cache configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Model configuration (LLM providers and embeddings)
    #[serde(default)]
    pub model: ModelConfig,

    /// Document processing configuration
    #[serde(default)]
    pub document: DocumentConfig,

    /// Query pipeline defaults
    #[serde(default)]
    pub query: QueryConfig,

    /// Vector store batching, queuing and alert thresholds
    #[serde(default)]
    pub store: StoreTuning,

    /// Health monitoring and stream lifecycle settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Filesystem layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ingestion coordinator settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// API server settings
    #[serde(default)]
    pub api: ApiConfig,
}

/// Vector database and embedding cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Qdrant server URL (gRPC endpoint)
    pub qdrant_url: String,

    /// Optional API key for authenticated Qdrant instances
    pub qdrant_api_key: Option<String>,

    /// Collection holding document chunks
    pub collection_name: String,

    /// Fixed embedding dimension; must equal the embedding model output
    pub vector_size: usize,

    /// Embedding cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Embedding cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable or disable the cache
    pub enabled: bool,

    /// SQLite database path
    pub db_path: String,

    /// Time-to-live for cache entries in seconds
    pub ttl_seconds: i64,
}

/// Model configuration for generation and embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ollama server URL
    pub ollama_url: String,

    /// Default model for text generation
    pub ollama_model: String,

    /// Request timeout in seconds
    pub ollama_timeout: u64,

    /// Model for embeddings
    pub embedding_model: String,

    /// Texts per embedding request batch
    pub embedding_batch_size: usize,

    /// In-process fallback model (GGUF)
    #[serde(default)]
    pub local: LocalModelConfig,
}

/// In-process model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModelConfig {
    /// Enable the in-process provider as generation fallback
    pub enabled: bool,

    /// Path to a GGUF model file or a directory containing one
    pub model_path: String,

    /// Hard cap on the generated sequence length
    pub max_length: usize,
}

/// Document processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Soft upload ceiling in megabytes (hard safety cap is 100MB)
    pub max_file_size_mb: u64,

    /// Maximum characters per chunk
    pub chunk_size: usize,

    /// Characters of sentence overlap carried into the next chunk
    pub chunk_overlap: usize,

    /// Reject documents producing more chunks than this
    pub max_chunks_per_document: usize,
}

/// Query pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Number of chunks retrieved per query
    pub top_k: usize,

    /// Minimum cosine similarity for retrieval
    pub score_threshold: f32,

    /// Character budget for the assembled context
    pub max_context_chars: usize,

    /// Generation temperature
    pub temperature: f32,

    /// Generation token cap
    pub max_tokens: u32,

    /// Generation deadline in seconds
    pub llm_timeout: u64,
}

/// Vector store batching, queuing and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreTuning {
    /// Points per internal upsert chunk
    pub batch_chunk_size: usize,

    /// Bound on the async operation queue
    pub max_queue_size: usize,

    /// Alert when an operation exceeds this many milliseconds
    pub slow_op_ms: u64,

    /// Alert when resident memory exceeds this many megabytes
    pub mem_high_mb: u64,

    /// Alert when queue depth exceeds this
    pub queue_high: usize,

    /// Alert when a per-op error rate exceeds this fraction
    pub err_rate_high: f64,
}

/// Health monitoring and stream lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between health checks
    pub health_interval_secs: u64,

    /// Consecutive failures before alert/recovery
    pub alert_threshold: u32,

    /// Restart a failing service automatically
    pub auto_recovery: bool,

    /// Minutes of inactivity before a stream connection is reaped
    pub idle_stream_timeout_mins: u64,
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root data directory
    pub data_dir: String,

    /// Persisted upload files
    pub upload_dir: String,

    /// Processed artifacts
    pub processed_dir: String,

    /// Cache files (embedding cache database lives here)
    pub cache_dir: String,
}

/// Ingestion coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Uploads processed concurrently
    pub max_concurrent: usize,

    /// Hours before a finished progress record is eligible for GC
    pub progress_retention_hours: u64,
}

/// API server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection_name: "ragd_documents".to_string(),
            vector_size: 384,
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: "data/cache/embeddings.db".to_string(),
            ttl_seconds: 3600,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2:1b".to_string(),
            ollama_timeout: 30,
            embedding_model: "nomic-embed-text".to_string(),
            embedding_batch_size: 32,
            local: LocalModelConfig::default(),
        }
    }
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: "models".to_string(),
            max_length: 2048,
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 50,
            chunk_size: 1000,
            chunk_overlap: 200,
            max_chunks_per_document: 1000,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.7,
            max_context_chars: 4000,
            temperature: 0.7,
            max_tokens: 1024,
            llm_timeout: 30,
        }
    }
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            batch_chunk_size: 100,
            max_queue_size: 1000,
            slow_op_ms: 1000,
            mem_high_mb: 800,
            queue_high: 500,
            err_rate_high: 0.05,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            alert_threshold: 3,
            auto_recovery: true,
            idle_stream_timeout_mins: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            upload_dir: "data/uploads".to_string(),
            processed_dir: "data/processed".to_string(),
            cache_dir: "data/cache".to_string(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            progress_retention_hours: 24,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Hard safety cap on uploads regardless of configuration
pub const HARD_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

impl RagConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: Self = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.database.qdrant_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid Qdrant URL: {}",
                self.database.qdrant_url
            ));
        }

        if !self.model.ollama_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid Ollama URL: {}",
                self.model.ollama_url
            ));
        }

        if self.model.ollama_model.is_empty() {
            return Err(anyhow::anyhow!("Generation model name cannot be empty"));
        }

        if self.model.embedding_model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if self.database.vector_size == 0 {
            return Err(anyhow::anyhow!("Vector size must be greater than 0"));
        }

        if self.document.chunk_overlap >= self.document.chunk_size {
            return Err(anyhow::anyhow!(
                "Chunk overlap must be less than chunk size"
            ));
        }

        if !(0.0..=1.0).contains(&self.query.score_threshold) {
            return Err(anyhow::anyhow!(
                "Score threshold must be between 0.0 and 1.0"
            ));
        }

        if !(0.0..=2.0).contains(&self.query.temperature) {
            return Err(anyhow::anyhow!(
                "Temperature must be between 0.0 and 2.0"
            ));
        }

        if self.store.batch_chunk_size == 0 {
            return Err(anyhow::anyhow!("Batch chunk size must be positive"));
        }

        if self.ingest.max_concurrent == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent ingests must be positive"
            ));
        }

        Ok(())
    }

    /// The effective upload ceiling in bytes, clamped to the hard cap
    pub fn max_file_size_bytes(&self) -> u64 {
        (self.document.max_file_size_mb * 1024 * 1024).min(HARD_MAX_FILE_SIZE)
    }

    /// Ensure all storage directories exist
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.storage.data_dir,
            &self.storage.upload_dir,
            &self.storage.processed_dir,
            &self.storage.cache_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.vector_size, 384);
        assert_eq!(config.query.top_k, 5);
        assert_eq!(config.model.ollama_url, "http://localhost:11434");
    }

    #[test]
    fn test_config_validation() {
        let mut config = RagConfig::default();
        assert!(config.validate().is_ok());

        config.database.qdrant_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config = RagConfig::default();
        config.document.chunk_overlap = config.document.chunk_size;
        assert!(config.validate().is_err());

        config = RagConfig::default();
        config.query.score_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_size_hard_cap() {
        let mut config = RagConfig::default();
        config.document.max_file_size_mb = 500;
        assert_eq!(config.max_file_size_bytes(), HARD_MAX_FILE_SIZE);

        config.document.max_file_size_mb = 10;
        assert_eq!(config.max_file_size_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = RagConfig::default();
        config.to_file(&path).unwrap();

        let loaded = RagConfig::from_file(&path).unwrap();
        assert_eq!(loaded.database.collection_name, config.database.collection_name);
        assert_eq!(loaded.document.chunk_size, config.document.chunk_size);
    }
}
