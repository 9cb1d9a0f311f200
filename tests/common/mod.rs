//! Shared fixtures for integration tests
//!
//! Every test runs with the vector database unreachable (exercising the
//! in-memory fallback) and an Ollama stub served by wiremock.

use ragd::{IngestionCoordinator, RagConfig, UploadProgress, UploadStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Embedding stub: one unit vector per input, regardless of text
pub struct EchoEmbed {
    pub dim: usize,
}

impl Respond for EchoEmbed {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let count = body["input"].as_array().map(|a| a.len()).unwrap_or(1);

        let mut vector = vec![0.0f32; self.dim];
        if self.dim > 0 {
            vector[0] = 1.0;
        }
        let embeddings: Vec<Vec<f32>> = (0..count).map(|_| vector.clone()).collect();

        ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({ "embeddings": embeddings }))
    }
}

/// Mount the full Ollama stub: tags probe, embeddings, and a fixed answer
/// for both unary and streaming generation
pub async fn mount_ollama(server: &MockServer, answer: &str) {
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{"name": "llama3.2:1b"}]
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(EchoEmbed { dim: 4 })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "llama3.2:1b",
            "response": answer,
            "done": true,
            "eval_count": 12,
            "prompt_eval_count": 64
        })))
        .mount(server)
        .await;

    // Streaming frames that concatenate to the unary answer
    let mut ndjson = String::new();
    for word in answer.split_inclusive(' ') {
        ndjson.push_str(&serde_json::json!({"response": word, "done": false}).to_string());
        ndjson.push('\n');
    }
    ndjson.push_str(&serde_json::json!({"response": "", "done": true}).to_string());
    ndjson.push('\n');

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
        .mount(server)
        .await;
}

/// Configuration pointing at the stub, with the vector database down
pub fn test_config(ollama_url: &str, data_dir: &Path, chunk_size: usize) -> RagConfig {
    let mut config = RagConfig::default();
    config.database.qdrant_url = "http://127.0.0.1:1".to_string();
    config.database.vector_size = 4;
    config.database.cache.enabled = false;
    config.model.ollama_url = ollama_url.to_string();
    config.document.chunk_size = chunk_size;
    config.document.chunk_overlap = 40.min(chunk_size.saturating_sub(1));
    config.storage.data_dir = data_dir.display().to_string();
    config.storage.upload_dir = data_dir.join("uploads").display().to_string();
    config.storage.processed_dir = data_dir.join("processed").display().to_string();
    config.storage.cache_dir = data_dir.join("cache").display().to_string();
    config
}

/// Poll an upload until it completes; panics on failure or timeout
pub async fn wait_for_completion(
    ingest: &Arc<IngestionCoordinator>,
    document_id: Uuid,
) -> UploadProgress {
    for _ in 0..400 {
        let progress = ingest
            .get_progress(document_id)
            .expect("progress record missing");
        match progress.status {
            UploadStatus::Completed => return progress,
            UploadStatus::Failed => {
                panic!("ingest failed: {:?}", progress.error_message)
            }
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("ingest did not complete in time");
}
