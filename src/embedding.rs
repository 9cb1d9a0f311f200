//! Text embedding service backed by an Ollama embedding model
//!
//! Batches requests, verifies the model dimension against the configured
//! collection dimension, and optionally caches vectors by content hash.

use crate::cache::EmbeddingCache;
use crate::config::{DatabaseConfig, ModelConfig};
use crate::error::{LlmError, RagError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Ollama batch embedding request
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

/// Ollama batch embedding response
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding performance counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct EmbeddingMetrics {
    pub total_texts: u64,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub total_time_secs: f64,
}

/// Text embedding service
pub struct EmbeddingService {
    client: reqwest::Client,
    config: ModelConfig,
    dimension: usize,
    cache: Option<Arc<EmbeddingCache>>,
    metrics: std::sync::Mutex<EmbeddingMetrics>,
}

impl EmbeddingService {
    /// Create a new embedding service without a cache
    pub fn new(model: ModelConfig, database: &DatabaseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(model.ollama_timeout))
            .build()?;

        Ok(Self {
            client,
            config: model,
            dimension: database.vector_size,
            cache: None,
            metrics: std::sync::Mutex::new(EmbeddingMetrics::default()),
        })
    }

    /// Create a new embedding service with the configured cache
    pub async fn with_cache(model: ModelConfig, database: &DatabaseConfig) -> Result<Self> {
        let mut service = Self::new(model, database)?;

        if database.cache.enabled {
            match EmbeddingCache::new(database.cache.clone()).await {
                Ok(cache) => service.cache = Some(Arc::new(cache)),
                Err(e) => warn!("Embedding cache unavailable, continuing without: {}", e),
            }
        }

        Ok(service)
    }

    /// The configured embedding dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn api_url(&self) -> String {
        format!("{}/api/embed", self.config.ollama_url.trim_end_matches('/'))
    }

    /// Encode a batch of texts, one vector per input in the same order
    pub async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        for text in texts {
            if text.trim().is_empty() {
                return Err(RagError::InvalidInput(
                    "Cannot embed empty or whitespace-only text".to_string(),
                ));
            }
        }

        let start = Instant::now();
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<usize> = Vec::new();
        let mut cache_hits = 0u64;

        if let Some(cache) = &self.cache {
            for (i, text) in texts.iter().enumerate() {
                let key = EmbeddingCache::compute_key(&self.config.embedding_model, text);
                match cache.get(&key).await {
                    Ok(Some(vector)) if vector.len() == self.dimension => {
                        vectors[i] = Some(vector);
                        cache_hits += 1;
                    }
                    Ok(_) => pending.push(i),
                    Err(e) => {
                        warn!("Embedding cache read failed: {}", e);
                        pending.push(i);
                    }
                }
            }
        } else {
            pending = (0..texts.len()).collect();
        }

        let mut requests = 0u64;
        for batch in pending.chunks(self.config.embedding_batch_size.max(1)) {
            let inputs: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let embeddings = self.request_embeddings(inputs).await?;
            requests += 1;

            if embeddings.len() != batch.len() {
                return Err(LlmError::InvalidResponse(format!(
                    "Expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                ))
                .into());
            }

            for (&i, vector) in batch.iter().zip(embeddings) {
                if vector.len() != self.dimension {
                    return Err(LlmError::InvalidResponse(format!(
                        "Embedding dimension mismatch: expected {}, got {}",
                        self.dimension,
                        vector.len()
                    ))
                    .into());
                }

                if let Some(cache) = &self.cache {
                    let key =
                        EmbeddingCache::compute_key(&self.config.embedding_model, &texts[i]);
                    if let Err(e) = cache.set(&key, &self.config.embedding_model, &vector).await {
                        warn!("Embedding cache write failed: {}", e);
                    }
                }

                vectors[i] = Some(vector);
            }
        }

        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.total_texts += texts.len() as u64;
            metrics.total_requests += requests;
            metrics.cache_hits += cache_hits;
            metrics.total_time_secs += start.elapsed().as_secs_f64();
        }

        debug!(
            "Encoded {} texts ({} cache hits) in {:.3}s",
            texts.len(),
            cache_hits,
            start.elapsed().as_secs_f64()
        );

        // Every slot is filled at this point; a hole would be a logic bug
        vectors
            .into_iter()
            .map(|v| v.ok_or_else(|| RagError::Internal("Missing embedding in batch".to_string())))
            .collect()
    }

    /// Encode a single text
    pub async fn encode_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.encode(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Internal("Empty embedding batch".to_string()))
    }

    async fn request_embeddings(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: self.config.embedding_model.clone(),
            input,
        };

        let url = self.api_url();
        debug!("Embedding request to: {}", url);

        let response = timeout(
            Duration::from_secs(self.config.ollama_timeout),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::EmbeddingFailed(error_text).into());
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(parsed.embeddings)
    }

    /// Cosine similarity between two vectors; 0 if either has zero norm
    pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }

    /// Cosine similarity of one query vector against many candidates
    pub fn batch_similarity(query: &[f32], candidates: &[Vec<f32>]) -> Vec<f32> {
        candidates
            .iter()
            .map(|c| Self::similarity(query, c))
            .collect()
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> EmbeddingMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Clear the embedding cache, if one is configured
    pub async fn clear_cache(&self) -> Result<u64> {
        match &self.cache {
            Some(cache) => cache
                .clear()
                .await
                .map_err(|e| RagError::Internal(e.to_string())),
            None => Ok(0),
        }
    }

    /// Health probe: verifies the model responds and the dimension matches
    pub async fn health_check(&self) -> serde_json::Value {
        let probe = self.request_embeddings(vec!["health probe".to_string()]).await;

        let (status, detail) = match &probe {
            Ok(vectors) if vectors.first().map(|v| v.len()) == Some(self.dimension) => {
                ("healthy", serde_json::Value::Null)
            }
            Ok(vectors) => (
                "unhealthy",
                serde_json::json!(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vectors.first().map(|v| v.len()).unwrap_or(0)
                )),
            ),
            Err(e) => ("unhealthy", serde_json::json!(e.to_string())),
        };

        let metrics = self.metrics();
        let cache_stats = match &self.cache {
            Some(cache) => cache
                .stats()
                .await
                .map(|s| serde_json::to_value(s).unwrap_or_default())
                .unwrap_or_default(),
            None => serde_json::Value::Null,
        };

        serde_json::json!({
            "status": status,
            "error": detail,
            "model": self.config.embedding_model,
            "dimension": self.dimension,
            "metrics": metrics,
            "cache": cache_stats,
        })
    }
}
