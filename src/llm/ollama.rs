//! Ollama HTTP generation provider
//!
//! Talks to `/api/generate`. Unary calls parse a single JSON body; streaming
//! calls parse line-delimited JSON frames until `done` is set.

use super::{GenerationOptions, LlmClient, LlmProvider, LlmResponse, TokenStream};
use crate::config::ModelConfig;
use crate::error::{LlmError, RagError, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, error};

/// Ollama API request for generation
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

/// Ollama API options
#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

/// Ollama API response for unary generation
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    done: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

/// One frame of the line-delimited streaming response
#[derive(Debug, Deserialize)]
struct OllamaStreamFrame {
    #[serde(default)]
    response: String,
    done: bool,
}

/// Ollama models list response, used by the availability probe
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelInfo {
    name: String,
}

/// HTTP client for an Ollama server
pub struct OllamaClient {
    client: reqwest::Client,
    config: ModelConfig,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: ModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.ollama_timeout))
            .build()?;

        Ok(Self { client, config })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.ollama_url.trim_end_matches('/'),
            endpoint
        )
    }

    async fn send_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request = OllamaGenerateRequest {
            model: self.config.ollama_model.clone(),
            prompt: prompt.to_string(),
            stream,
            options: OllamaOptions {
                num_predict: options.max_tokens,
                temperature: options.temperature,
            },
        };

        let url = self.api_url("generate");
        debug!("Making request to: {}", url);

        let response = timeout(
            options.timeout,
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
            error!("Ollama API error: {}", error_text);
            return Err(LlmError::GenerationFailed(error_text).into());
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<LlmResponse> {
        let start = Instant::now();
        let response = self.send_generate(prompt, options, false).await?;

        let body: OllamaGenerateResponse = timeout(options.timeout, response.json())
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if !body.done {
            return Err(LlmError::InvalidResponse("Incomplete response".to_string()).into());
        }

        let mut metadata = HashMap::new();
        if let Some(eval_duration) = body.eval_duration {
            metadata.insert(
                "eval_duration_ns".to_string(),
                serde_json::json!(eval_duration),
            );
        }

        debug!("Generated {} tokens", body.eval_count.unwrap_or(0));

        Ok(LlmResponse {
            text: body.response,
            provider: LlmProvider::Ollama,
            model_name: body.model.unwrap_or_else(|| self.config.ollama_model.clone()),
            tokens_used: body.eval_count,
            prompt_tokens: body.prompt_eval_count,
            response_time: start.elapsed().as_secs_f64(),
            metadata,
        })
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let response = self.send_generate(prompt, options, true).await?;
        let chunk_timeout = options.timeout;

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let next = timeout(chunk_timeout, body.next())
                    .await
                    .map_err(|_| RagError::from(LlmError::Timeout))?;

                let Some(bytes) = next else { break };
                let bytes =
                    bytes.map_err(|e| RagError::from(LlmError::ConnectionFailed(e.to_string())))?;
                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let frame: OllamaStreamFrame = serde_json::from_str(line)
                        .map_err(|e| RagError::from(LlmError::InvalidResponse(e.to_string())))?;

                    if !frame.response.is_empty() {
                        yield frame.response;
                    }
                    if frame.done {
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn probe(&self) -> Result<()> {
        let url = self.api_url("tags");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::ConnectionFailed(format!(
                "probe returned {}",
                response.status()
            ))
            .into());
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        debug!("Ollama probe found {} models", tags.models.len());

        let wanted = &self.config.ollama_model;
        if !tags.models.iter().any(|m| &m.name == wanted) {
            // The model may still be pullable; treat as available but note it
            debug!("Configured model '{}' not in local tag list", wanted);
        }

        Ok(())
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Ollama
    }

    fn model_name(&self) -> String {
        self.config.ollama_model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(url: &str) -> OllamaClient {
        let mut config = ModelConfig::default();
        config.ollama_url = url.to_string();
        config.ollama_model = "llama3.2:1b".to_string();
        OllamaClient::new(config).unwrap()
    }

    #[test]
    fn test_api_url_generation() {
        let client = client_for("http://localhost:11434");
        assert_eq!(
            client.api_url("generate"),
            "http://localhost:11434/api/generate"
        );
        assert_eq!(client.api_url("tags"), "http://localhost:11434/api/tags");
    }

    #[tokio::test]
    async fn test_generate_unary() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llama3.2:1b",
                "response": "Paris is the capital of France.",
                "done": true,
                "eval_count": 8,
                "prompt_eval_count": 12,
                "eval_duration": 12345
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let response = client
            .generate("What is the capital of France?", &GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(response.text, "Paris is the capital of France.");
        assert_eq!(response.tokens_used, Some(8));
        assert_eq!(response.prompt_tokens, Some(12));
        assert_eq!(response.provider, LlmProvider::Ollama);
    }

    #[tokio::test]
    async fn test_generate_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let result = client.generate("hi", &GenerationOptions::default()).await;
        assert!(matches!(
            result,
            Err(RagError::Llm(LlmError::GenerationFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_generate_streaming_frames() {
        let server = MockServer::start().await;

        let ndjson = concat!(
            "{\"response\":\"Hello\",\"done\":false}\n",
            "{\"response\":\" world\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
        );

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let mut stream = client
            .generate_streaming("hi", &GenerationOptions::default())
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        assert_eq!(chunks, vec!["Hello", " world"]);
    }

    #[tokio::test]
    async fn test_probe() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "llama3.2:1b"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        assert!(client.probe().await.is_ok());
    }
}
