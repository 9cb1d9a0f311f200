//! RAG query pipeline
//!
//! Orchestrates query embedding, vector search, context assembly under a
//! character budget, prompt construction, generation and validation. The
//! streaming path shares everything up to prompt construction and then
//! forwards provider tokens verbatim.

use crate::embedding::EmbeddingService;
use crate::error::{RagError, Result};
use crate::llm::{GenerationOptions, LlmService, TokenStream};
use crate::prompt::{PromptEngine, QueryType, ResponseFormat, SafetyLevel, ValidationStatus};
use crate::store::{SearchFilters, SearchResult, VectorStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NO_RESULTS_ANSWER: &str = "I couldn't find any relevant information in the available documents to answer your question. Please try rephrasing your query or ask about a different topic.";

/// Pipeline response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RagStatus {
    Ready,
    Processing,
    Error,
    NoResults,
}

/// A query with its retrieval and generation knobs
#[derive(Debug, Clone)]
pub struct RagQuery {
    pub query: String,
    pub top_k: usize,
    pub score_threshold: f32,
    pub max_context_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub filters: Option<SearchFilters>,
    pub query_type: Option<QueryType>,
    pub response_format: Option<ResponseFormat>,
    pub include_sources: bool,
    pub safety_level: SafetyLevel,
}

impl RagQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: 5,
            score_threshold: 0.7,
            max_context_chars: 4000,
            temperature: 0.7,
            max_tokens: 1024,
            filters: None,
            query_type: None,
            response_format: None,
            include_sources: true,
            safety_level: SafetyLevel::Standard,
        }
    }
}

/// Assembled context fed to the prompt engine
#[derive(Debug, Clone, Serialize)]
pub struct RagContext {
    pub query: String,
    pub retrieved: Vec<SearchResult>,
    pub assembled_context: String,
    pub context_length: usize,
    pub source_files: Vec<String>,
    pub relevance_scores: Vec<f32>,
}

impl RagContext {
    fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            retrieved: Vec::new(),
            assembled_context: String::new(),
            context_length: 0,
            source_files: Vec::new(),
            relevance_scores: Vec::new(),
        }
    }
}

/// Source attribution entry
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub file: String,
    pub chunk_index: usize,
    pub score: f32,
    pub text_preview: String,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

/// Complete pipeline response
#[derive(Debug, Clone, Serialize)]
pub struct RagResponse {
    pub answer: String,
    pub context: RagContext,
    pub response_time: f64,
    pub tokens_used: Option<u32>,
    pub sources: Vec<SourceInfo>,
    pub metadata: serde_json::Value,
    pub validation_status: ValidationStatus,
    pub safety_score: f32,
}

/// Rolling pipeline metrics
#[derive(Debug, Default, Clone, Serialize)]
pub struct RagMetrics {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub avg_response_time: f64,
    pub avg_retrieval_time: f64,
    pub avg_generation_time: f64,
    pub avg_context_length: f64,
    pub avg_documents_retrieved: f64,
    pub avg_safety_score: f64,
    pub validation_warnings: u64,
    pub validation_errors: u64,
}

struct MetricsInner {
    metrics: RagMetrics,
    total_response_time: f64,
    total_retrieval_time: f64,
    total_generation_time: f64,
}

/// The RAG pipeline
pub struct RagPipeline {
    embedder: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
    llm: Arc<LlmService>,
    engine: PromptEngine,
    llm_timeout: Duration,
    metrics: std::sync::Mutex<MetricsInner>,
    started: Instant,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<EmbeddingService>,
        store: Arc<VectorStore>,
        llm: Arc<LlmService>,
        llm_timeout: Duration,
    ) -> Self {
        info!("RAG pipeline initialized");
        Self {
            embedder,
            store,
            llm,
            engine: PromptEngine::new(),
            llm_timeout,
            metrics: std::sync::Mutex::new(MetricsInner {
                metrics: RagMetrics {
                    avg_safety_score: 1.0,
                    ..RagMetrics::default()
                },
                total_response_time: 0.0,
                total_retrieval_time: 0.0,
                total_generation_time: 0.0,
            }),
            started: Instant::now(),
        }
    }

    /// Answer a query with retrieval-grounded generation
    pub async fn query(&self, rag_query: RagQuery) -> Result<RagResponse> {
        let start = Instant::now();
        debug!("Processing query: {:.100}", rag_query.query);

        let retrieval_start = Instant::now();
        let retrieved = match self.retrieve(&rag_query).await {
            Ok(documents) => documents,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };
        let retrieval_time = retrieval_start.elapsed().as_secs_f64();

        if retrieved.is_empty() {
            // A valid query over an empty result set is not a failure
            warn!("No relevant documents found for query");
            return Ok(self.no_results_response(&rag_query, start));
        }

        let context = assemble_context(&rag_query, retrieved);
        let prompt = self.engine.create_prompt(
            &rag_query.query,
            rag_query.query_type,
            &context,
            rag_query.safety_level,
            rag_query.response_format,
        );

        let generation_start = Instant::now();
        let options = GenerationOptions {
            temperature: rag_query.temperature,
            max_tokens: rag_query.max_tokens,
            timeout: self.llm_timeout,
        };

        let llm_response = match self.llm.generate(&prompt, &options).await {
            Ok(response) => response,
            Err(e) => {
                // Generation failures become a user-facing answer
                warn!("Generation failed: {}", e);
                self.record_failure();
                return Ok(self.error_response(&rag_query, context, &e, start));
            }
        };
        let generation_time = generation_start.elapsed().as_secs_f64();

        let (validation_status, safety_score) =
            self.engine
                .validate_response(&llm_response.text, &rag_query.query, &context);

        let sources = if rag_query.include_sources {
            Self::sources_of(&context.retrieved)
        } else {
            Vec::new()
        };

        let avg_relevance = if context.relevance_scores.is_empty() {
            0.0
        } else {
            context.relevance_scores.iter().sum::<f32>() / context.relevance_scores.len() as f32
        };

        let response_time = start.elapsed().as_secs_f64();
        let response = RagResponse {
            answer: llm_response.text,
            metadata: serde_json::json!({
                "status": RagStatus::Ready,
                "provider": llm_response.provider,
                "model_name": llm_response.model_name,
                "context_length": context.context_length,
                "documents_retrieved": context.retrieved.len(),
                "avg_relevance": avg_relevance,
                "validation_status": validation_status,
                "safety_score": safety_score,
            }),
            context,
            response_time,
            tokens_used: llm_response.tokens_used,
            sources,
            validation_status,
            safety_score,
        };

        self.record_success(
            response_time,
            retrieval_time,
            generation_time,
            &response.context,
            validation_status,
            safety_score,
        );

        info!("Query completed in {:.2}s", response_time);
        Ok(response)
    }

    /// Answer a query as a lazy stream of text chunks. Validation does not
    /// run on the streaming path.
    pub async fn query_stream(&self, rag_query: RagQuery) -> Result<TokenStream> {
        let start = Instant::now();
        debug!("Processing streaming query: {:.100}", rag_query.query);

        let retrieval_start = Instant::now();
        let retrieved = match self.retrieve(&rag_query).await {
            Ok(documents) => documents,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };
        let retrieval_time = retrieval_start.elapsed().as_secs_f64();

        if retrieved.is_empty() {
            let single: Vec<Result<String>> = vec![Ok(NO_RESULTS_ANSWER.to_string())];
            return Ok(Box::pin(futures::stream::iter(single)));
        }

        let context = assemble_context(&rag_query, retrieved);
        let prompt = self.engine.create_prompt(
            &rag_query.query,
            rag_query.query_type,
            &context,
            rag_query.safety_level,
            rag_query.response_format,
        );

        let options = GenerationOptions {
            temperature: rag_query.temperature,
            max_tokens: rag_query.max_tokens,
            timeout: self.llm_timeout,
        };

        let stream = match self.llm.generate_streaming(&prompt, &options).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Streaming generation failed: {}", e);
                self.record_failure();
                let single: Vec<Result<String>> = vec![Ok(format!(
                    "Sorry, an error occurred while processing your query: {e}"
                ))];
                return Ok(Box::pin(futures::stream::iter(single)));
            }
        };

        let response_time = start.elapsed().as_secs_f64();
        self.record_success(
            response_time,
            retrieval_time,
            response_time,
            &context,
            ValidationStatus::Valid,
            1.0,
        );

        Ok(stream)
    }

    async fn retrieve(&self, rag_query: &RagQuery) -> Result<Vec<SearchResult>> {
        let query_vector = self
            .embedder
            .encode_one(&rag_query.query)
            .await
            .map_err(|e| RagError::Retrieval(format!("Query embedding failed: {e}")))?;

        let filters = rag_query.filters.clone().unwrap_or_default();
        match self
            .store
            .search(
                &query_vector,
                rag_query.top_k,
                rag_query.score_threshold,
                &filters,
            )
            .await
        {
            Ok(results) => {
                debug!("Retrieved {} documents", results.len());
                Ok(results)
            }
            // Degraded-mode misses surface as an empty result set; a live
            // store failing is a real error
            Err(_) if self.store.is_fallback() => Ok(Vec::new()),
            Err(e) => Err(RagError::Retrieval(e.to_string())),
        }
    }

    fn sources_of(retrieved: &[SearchResult]) -> Vec<SourceInfo> {
        retrieved
            .iter()
            .map(|doc| {
                let preview: String = if doc.text.chars().count() > 200 {
                    format!("{}...", doc.text.chars().take(200).collect::<String>())
                } else {
                    doc.text.clone()
                };
                SourceInfo {
                    file: doc.source_file.clone(),
                    chunk_index: doc.chunk_index,
                    score: doc.score,
                    text_preview: preview,
                    metadata: doc.metadata.clone(),
                }
            })
            .collect()
    }

    fn no_results_response(&self, rag_query: &RagQuery, start: Instant) -> RagResponse {
        RagResponse {
            answer: NO_RESULTS_ANSWER.to_string(),
            context: RagContext::empty(&rag_query.query),
            response_time: start.elapsed().as_secs_f64(),
            tokens_used: None,
            sources: Vec::new(),
            metadata: serde_json::json!({ "status": RagStatus::NoResults }),
            validation_status: ValidationStatus::Valid,
            safety_score: 1.0,
        }
    }

    fn error_response(
        &self,
        _rag_query: &RagQuery,
        context: RagContext,
        error: &RagError,
        start: Instant,
    ) -> RagResponse {
        RagResponse {
            answer: format!(
                "Sorry, I encountered an error while processing your query: {error}. Please try again later."
            ),
            context,
            response_time: start.elapsed().as_secs_f64(),
            tokens_used: None,
            sources: Vec::new(),
            metadata: serde_json::json!({
                "status": RagStatus::Error,
                "error": error.to_string(),
            }),
            validation_status: ValidationStatus::Error,
            safety_score: 1.0,
        }
    }

    fn record_success(
        &self,
        response_time: f64,
        retrieval_time: f64,
        generation_time: f64,
        context: &RagContext,
        validation_status: ValidationStatus,
        safety_score: f32,
    ) {
        let mut inner = self.metrics.lock().unwrap();
        inner.metrics.total_queries += 1;
        inner.metrics.successful_queries += 1;

        inner.total_response_time += response_time;
        inner.total_retrieval_time += retrieval_time;
        inner.total_generation_time += generation_time;

        let n = inner.metrics.total_queries as f64;
        inner.metrics.avg_response_time = inner.total_response_time / n;
        inner.metrics.avg_retrieval_time = inner.total_retrieval_time / n;
        inner.metrics.avg_generation_time = inner.total_generation_time / n;

        inner.metrics.avg_context_length =
            (inner.metrics.avg_context_length * (n - 1.0) + context.context_length as f64) / n;
        inner.metrics.avg_documents_retrieved =
            (inner.metrics.avg_documents_retrieved * (n - 1.0) + context.retrieved.len() as f64)
                / n;
        inner.metrics.avg_safety_score =
            (inner.metrics.avg_safety_score * (n - 1.0) + safety_score as f64) / n;

        match validation_status {
            ValidationStatus::Warning => inner.metrics.validation_warnings += 1,
            ValidationStatus::Error => inner.metrics.validation_errors += 1,
            ValidationStatus::Valid => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.metrics.lock().unwrap();
        inner.metrics.total_queries += 1;
        inner.metrics.failed_queries += 1;
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> RagMetrics {
        self.metrics.lock().unwrap().metrics.clone()
    }

    /// Cheap readiness probe: reports counters without touching any
    /// downstream service
    pub fn readiness(&self) -> serde_json::Value {
        let metrics = self.metrics();
        serde_json::json!({
            "status": "healthy",
            "uptime_secs": self.started.elapsed().as_secs_f64(),
            "total_queries": metrics.total_queries,
            "successful_queries": metrics.successful_queries,
            "failed_queries": metrics.failed_queries,
        })
    }

    /// Full metrics payload
    pub fn metrics_report(&self) -> serde_json::Value {
        let metrics = self.metrics();
        let success_rate = if metrics.total_queries > 0 {
            metrics.successful_queries as f64 / metrics.total_queries as f64
        } else {
            0.0
        };

        serde_json::json!({
            "uptime_secs": self.started.elapsed().as_secs_f64(),
            "success_rate": success_rate,
            "metrics": metrics,
        })
    }
}

/// Assemble ranked chunks into the context window under the char budget.
/// A document that no longer fits is truncated only when at least 100
/// characters of budget remain; assembly stops at the first cut.
fn assemble_context(rag_query: &RagQuery, documents: Vec<SearchResult>) -> RagContext {
    let mut sorted = documents;
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut parts: Vec<String> = Vec::new();
    let mut total_length = 0usize;
    let mut source_files: Vec<String> = Vec::new();
    let mut relevance_scores: Vec<f32> = Vec::new();

    for doc in &sorted {
        let doc_length = doc.text.chars().count();

        if total_length + doc_length > rag_query.max_context_chars {
            let remaining = rag_query.max_context_chars.saturating_sub(total_length);
            if remaining > 100 {
                let truncated: String = doc.text.chars().take(remaining).collect();
                parts.push(format!(
                    "Source: {}\n{}\n{}...\n",
                    doc.source_file, doc.chunk_index, truncated
                ));
                source_files.push(doc.source_file.clone());
                relevance_scores.push(doc.score);
                total_length += remaining;
            }
            break;
        }

        parts.push(format!(
            "Source: {}\n{}\n{}\n",
            doc.source_file, doc.chunk_index, doc.text
        ));
        source_files.push(doc.source_file.clone());
        relevance_scores.push(doc.score);
        total_length += doc_length;
    }

    let mut deduped = Vec::new();
    for file in source_files {
        if !deduped.contains(&file) {
            deduped.push(file);
        }
    }

    RagContext {
        query: rag_query.query.clone(),
        retrieved: sorted,
        assembled_context: parts.join("\n"),
        context_length: total_length,
        source_files: deduped,
        relevance_scores,
    }
}
