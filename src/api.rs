//! REST adapter over the core services
//!
//! A thin mapping of the core operations onto HTTP: document upload and
//! progress, listing and deletion, unary and streaming queries, stream
//! connection management, health and metrics. Streaming responses are SSE
//! frames carrying the wire events of [`crate::streams::StreamEvent`].

use crate::error::RagError;
use crate::factory::ServiceFactory;
use crate::pipeline::RagQuery;
use crate::prompt::{QueryType, ResponseFormat, SafetyLevel};
use crate::store::SearchFilters;
use crate::streams::StreamEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub factory: Arc<ServiceFactory>,
}

/// Upload acknowledgement
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub document_id: Uuid,
    pub filename: String,
    pub file_size: usize,
    pub status: String,
}

/// Pre-upload validation request
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub filename: String,
    pub file_size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Query request mapping onto [`RagQuery`]
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub score_threshold: Option<f32>,
    #[serde(default)]
    pub max_context_chars: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub source_files: Option<Vec<String>>,
    #[serde(default)]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub include_sources: Option<bool>,
    #[serde(default)]
    pub safety_level: Option<SafetyLevel>,
}

/// Paging parameters for document listing
#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(error: &RagError) -> (StatusCode, Json<ErrorBody>) {
    let status = match error {
        RagError::InvalidInput(_) | RagError::UnsupportedFormat(_) | RagError::Decode(_) => {
            StatusCode::BAD_REQUEST
        }
        RagError::NotFound(_) => StatusCode::NOT_FOUND,
        RagError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RagError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

fn service_unavailable(name: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            error: format!("{name} service not available"),
        }),
    )
}

impl QueryRequest {
    fn into_rag_query(self, state: &AppState) -> RagQuery {
        let defaults = &state.factory.config().query;
        let mut rag_query = RagQuery::new(self.query);
        rag_query.top_k = self.top_k.unwrap_or(defaults.top_k);
        rag_query.score_threshold = self.score_threshold.unwrap_or(defaults.score_threshold);
        rag_query.max_context_chars =
            self.max_context_chars.unwrap_or(defaults.max_context_chars);
        rag_query.temperature = self.temperature.unwrap_or(defaults.temperature);
        rag_query.max_tokens = self.max_tokens.unwrap_or(defaults.max_tokens);
        rag_query.query_type = self.query_type;
        rag_query.response_format = self.response_format;
        rag_query.include_sources = self.include_sources.unwrap_or(true);
        rag_query.safety_level = self.safety_level.unwrap_or_default();
        rag_query.filters = self.source_files.map(|files| SearchFilters {
            source_files: Some(files),
            ..SearchFilters::default()
        });
        rag_query
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_health_handler))
        .route(
            "/api/v1/documents/{name}",
            post(upload_handler).delete(delete_document_handler),
        )
        .route(
            "/api/v1/documents/{document_id}/progress",
            get(progress_handler),
        )
        .route("/api/v1/documents/validate", post(validate_handler))
        .route("/api/v1/documents", get(list_documents_handler))
        .route("/api/v1/query", post(query_handler))
        .route("/api/v1/query/stream", post(query_stream_handler))
        .route("/api/v1/connections", get(list_connections_handler))
        .route(
            "/api/v1/connections/{connection_id}",
            delete(close_connection_handler),
        )
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Liveness probe
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = state.factory.check_health().await;
    Json(serde_json::json!({
        "status": report["overall_status"],
        "version": crate::VERSION,
    }))
}

/// Full health report across services
async fn detailed_health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.factory.check_health().await)
}

/// Accept an upload body and start background ingestion
async fn upload_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let Some(ingest) = state.factory.ingest() else {
        return service_unavailable("ingestion").into_response();
    };

    let file_size = body.len();
    match ingest.start_ingest(&filename, body.to_vec()).await {
        Ok(document_id) => Json(UploadResponse {
            document_id,
            filename,
            file_size,
            status: "processing".to_string(),
        })
        .into_response(),
        Err(e) => {
            error!("Upload of {} rejected: {}", filename, e);
            error_response(&e).into_response()
        }
    }
}

/// Progress snapshot for an upload
async fn progress_handler(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> impl IntoResponse {
    let Some(ingest) = state.factory.ingest() else {
        return service_unavailable("ingestion").into_response();
    };

    match ingest.get_progress(document_id) {
        Ok(progress) => Json(progress).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Validate a file before uploading it
async fn validate_handler(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> impl IntoResponse {
    let Some(ingest) = state.factory.ingest() else {
        return service_unavailable("ingestion").into_response();
    };

    Json(ingest.validate(
        &request.filename,
        request.file_size,
        request.content_type.as_deref(),
    ))
    .into_response()
}

/// List stored documents grouped by source file
async fn list_documents_handler(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
) -> impl IntoResponse {
    let Some(store) = state.factory.store() else {
        return service_unavailable("vector store").into_response();
    };

    match store.list(page.limit, page.offset).await {
        Ok(documents) => Json(serde_json::json!({ "documents": documents })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Delete a document's chunks and persisted upload
async fn delete_document_handler(
    State(state): State<AppState>,
    Path(source_file): Path<String>,
) -> impl IntoResponse {
    let Some(ingest) = state.factory.ingest() else {
        return service_unavailable("ingestion").into_response();
    };

    match ingest.delete_document(&source_file).await {
        Ok(deleted) => Json(serde_json::json!({
            "source_file": source_file,
            "chunks_deleted": deleted,
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Unary query
async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    let Some(pipeline) = state.factory.pipeline() else {
        return service_unavailable("pipeline").into_response();
    };

    let rag_query = request.into_rag_query(&state);
    match pipeline.query(rag_query).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Streaming query over SSE; each frame carries one wire event
async fn query_stream_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    let Some(pipeline) = state.factory.pipeline() else {
        return service_unavailable("pipeline").into_response();
    };

    let registry = state.factory.streams();
    let metadata = std::collections::HashMap::from([(
        "query".to_string(),
        serde_json::json!(request.query.chars().take(100).collect::<String>()),
    )]);
    let (connection_id, cancel) = registry.open(metadata);

    let rag_query = request.into_rag_query(&state);
    let tokens = match pipeline.query_stream(rag_query).await {
        Ok(stream) => stream,
        Err(e) => {
            registry.close(connection_id);
            return error_response(&e).into_response();
        }
    };

    let sse_registry = registry.clone();
    let stream = async_stream::stream! {
        let mut tokens = tokens;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokens.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            sse_registry.touch(connection_id);
                            let event = StreamEvent::Content { content: chunk };
                            yield Ok::<Event, Infallible>(wire_event(&event));
                        }
                        Some(Err(e)) => {
                            let event = StreamEvent::Error { message: e.to_string() };
                            yield Ok(wire_event(&event));
                            break;
                        }
                        None => {
                            yield Ok(wire_event(&StreamEvent::End));
                            break;
                        }
                    }
                }
            }
        }
        sse_registry.close(connection_id);
    };

    (
        [("x-connection-id", connection_id.to_string())],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

fn wire_event(event: &StreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

/// List tracked stream connections
async fn list_connections_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connections = state.factory.streams().list();
    Json(serde_json::json!({ "connections": connections }))
}

/// Close a stream connection, cancelling its generation
async fn close_connection_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> impl IntoResponse {
    if state.factory.streams().close(connection_id) {
        Json(serde_json::json!({ "closed": connection_id })).into_response()
    } else {
        error_response(&RagError::NotFound(format!("Connection {connection_id}"))).into_response()
    }
}

/// Collection statistics
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(store) = state.factory.store() else {
        return service_unavailable("vector store").into_response();
    };

    match store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Pipeline and store metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pipeline_metrics = state
        .factory
        .pipeline()
        .map(|p| p.metrics_report())
        .unwrap_or(serde_json::Value::Null);
    let store_metrics = state
        .factory
        .store()
        .map(|s| s.detailed_metrics())
        .unwrap_or(serde_json::Value::Null);

    Json(serde_json::json!({
        "pipeline": pipeline_metrics,
        "vector_store": store_metrics,
    }))
    .into_response()
}

/// Start the API server
pub async fn start_server(state: AppState, host: &str, port: u16) -> crate::error::Result<()> {
    let addr = format!("{host}:{port}");
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| RagError::Internal(format!("Server error: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_minimal_deserialization() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"query": "What is Rust?"}"#).unwrap();
        assert_eq!(request.query, "What is Rust?");
        assert!(request.top_k.is_none());
        assert!(request.source_files.is_none());
    }

    #[test]
    fn test_query_request_full_deserialization() {
        let request: QueryRequest = serde_json::from_str(
            r#"{
                "query": "compare things",
                "top_k": 3,
                "score_threshold": 0.5,
                "temperature": 0.1,
                "source_files": ["a.txt"],
                "response_format": "bullet_points",
                "safety_level": "conservative"
            }"#,
        )
        .unwrap();
        assert_eq!(request.top_k, Some(3));
        assert_eq!(request.response_format, Some(ResponseFormat::BulletPoints));
        assert_eq!(request.safety_level, Some(SafetyLevel::Conservative));
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = error_response(&RagError::NotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(&RagError::InvalidInput("x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(&RagError::Timeout);
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

        let (status, _) = error_response(&RagError::Internal("x".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
