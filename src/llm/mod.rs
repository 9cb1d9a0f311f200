//! Language model integration
//!
//! Two providers sit behind one interface: an HTTP-served Ollama model and
//! an in-process GGUF model. The service probes providers at startup, keeps
//! a current provider, and on a failed call tries the other provider exactly
//! once before giving up.

pub mod local;
pub mod ollama;

pub use local::LocalModelClient;
pub use ollama::OllamaClient;

use crate::config::ModelConfig;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identifies a generation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Local,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::Local => write!(f, "local"),
        }
    }
}

/// Knobs for a single generation call
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Response from unary text generation
#[derive(Debug, Clone, Serialize)]
pub struct LlmResponse {
    pub text: String,
    pub provider: LlmProvider,
    pub model_name: String,
    pub tokens_used: Option<u32>,
    pub prompt_tokens: Option<u32>,
    pub response_time: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Lazy sequence of generated text chunks
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Trait for text generation backends
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a complete response for a prompt
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<LlmResponse>;

    /// Generate a response as a lazy stream of text chunks
    async fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TokenStream>;

    /// Cheap availability probe
    async fn probe(&self) -> Result<()>;

    /// Which backend this is
    fn provider(&self) -> LlmProvider;

    /// Model identifier served by this backend
    fn model_name(&self) -> String;
}

/// Per-provider call counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProviderMetrics {
    pub calls: u64,
    pub failures: u64,
    pub failovers: u64,
}

/// Generation service with provider selection and per-call failover
pub struct LlmService {
    clients: HashMap<LlmProvider, Arc<dyn LlmClient>>,
    current: std::sync::RwLock<LlmProvider>,
    metrics: std::sync::Mutex<HashMap<LlmProvider, ProviderMetrics>>,
}

impl LlmService {
    /// Build the service from configuration, probing providers in order
    ///
    /// Ollama is the primary; the in-process model (when enabled and
    /// loadable) is the secondary. Fails only when no provider answers its
    /// probe.
    pub async fn initialize(config: &ModelConfig) -> Result<Self> {
        let mut clients: HashMap<LlmProvider, Arc<dyn LlmClient>> = HashMap::new();

        let ollama = Arc::new(OllamaClient::new(config.clone())?);
        clients.insert(LlmProvider::Ollama, ollama);

        if config.local.enabled {
            match LocalModelClient::load(&config.local).await {
                Ok(local) => {
                    clients.insert(LlmProvider::Local, Arc::new(local));
                }
                Err(e) => warn!("In-process model unavailable: {}", e),
            }
        }

        let mut current = None;
        for provider in [LlmProvider::Ollama, LlmProvider::Local] {
            if let Some(client) = clients.get(&provider) {
                match client.probe().await {
                    Ok(()) => {
                        info!("LLM provider '{}' is available", provider);
                        current = Some(provider);
                        break;
                    }
                    Err(e) => warn!("LLM provider '{}' probe failed: {}", provider, e),
                }
            }
        }

        let current = current.ok_or(LlmError::AllProvidersFailed)?;
        info!("LLM service initialized with provider '{}'", current);

        Ok(Self {
            clients,
            current: std::sync::RwLock::new(current),
            metrics: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Build a service around explicit clients (used by tests)
    pub fn from_clients(
        clients: Vec<Arc<dyn LlmClient>>,
        current: LlmProvider,
    ) -> Self {
        let clients = clients.into_iter().map(|c| (c.provider(), c)).collect();
        Self {
            clients,
            current: std::sync::RwLock::new(current),
            metrics: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The provider used for the next call
    pub fn current_provider(&self) -> LlmProvider {
        *self.current.read().unwrap()
    }

    /// Switch providers between calls
    pub fn switch_provider(&self, provider: LlmProvider) -> Result<()> {
        if !self.clients.contains_key(&provider) {
            return Err(LlmError::ModelNotFound(provider.to_string()).into());
        }
        *self.current.write().unwrap() = provider;
        info!("Switched LLM provider to '{}'", provider);
        Ok(())
    }

    fn record(&self, provider: LlmProvider, success: bool, failover: bool) {
        let mut metrics = self.metrics.lock().unwrap();
        let entry = metrics.entry(provider).or_default();
        entry.calls += 1;
        if !success {
            entry.failures += 1;
        }
        if failover {
            entry.failovers += 1;
        }
    }

    fn other_provider(&self, provider: LlmProvider) -> Option<(LlmProvider, Arc<dyn LlmClient>)> {
        self.clients
            .iter()
            .find(|(p, _)| **p != provider)
            .map(|(p, c)| (*p, c.clone()))
    }

    /// Generate with the current provider, failing over exactly once
    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<LlmResponse> {
        let provider = self.current_provider();
        let client = self
            .clients
            .get(&provider)
            .ok_or(LlmError::AllProvidersFailed)?
            .clone();

        match client.generate(prompt, options).await {
            Ok(response) => {
                self.record(provider, true, false);
                Ok(response)
            }
            Err(primary_err) => {
                self.record(provider, false, false);
                warn!(
                    "Provider '{}' failed ({}), attempting failover",
                    provider, primary_err
                );

                let Some((other, fallback)) = self.other_provider(provider) else {
                    return Err(primary_err);
                };

                match fallback.generate(prompt, options).await {
                    Ok(response) => {
                        self.record(other, true, true);
                        debug!("Failover to '{}' succeeded", other);
                        Ok(response)
                    }
                    Err(fallback_err) => {
                        self.record(other, false, true);
                        warn!("Failover to '{}' failed: {}", other, fallback_err);
                        Err(LlmError::AllProvidersFailed.into())
                    }
                }
            }
        }
    }

    /// Start a streaming generation, failing over once if the stream cannot start
    pub async fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let provider = self.current_provider();
        let client = self
            .clients
            .get(&provider)
            .ok_or(LlmError::AllProvidersFailed)?
            .clone();

        match client.generate_streaming(prompt, options).await {
            Ok(stream) => {
                self.record(provider, true, false);
                Ok(stream)
            }
            Err(primary_err) => {
                self.record(provider, false, false);
                warn!(
                    "Provider '{}' stream failed ({}), attempting failover",
                    provider, primary_err
                );

                let Some((other, fallback)) = self.other_provider(provider) else {
                    return Err(primary_err);
                };

                match fallback.generate_streaming(prompt, options).await {
                    Ok(stream) => {
                        self.record(other, true, true);
                        Ok(stream)
                    }
                    Err(fallback_err) => {
                        self.record(other, false, true);
                        warn!("Failover stream to '{}' failed: {}", other, fallback_err);
                        Err(LlmError::AllProvidersFailed.into())
                    }
                }
            }
        }
    }

    /// Per-provider metrics snapshot
    pub fn metrics(&self) -> HashMap<String, ProviderMetrics> {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .map(|(p, m)| (p.to_string(), m.clone()))
            .collect()
    }

    /// Health probe across registered providers
    pub async fn health_check(&self) -> serde_json::Value {
        let mut providers = serde_json::Map::new();
        let mut any_healthy = false;

        for (provider, client) in &self.clients {
            let healthy = client.probe().await.is_ok();
            any_healthy |= healthy;
            providers.insert(
                provider.to_string(),
                serde_json::json!({
                    "status": if healthy { "healthy" } else { "unhealthy" },
                    "model": client.model_name(),
                }),
            );
        }

        serde_json::json!({
            "status": if any_healthy { "healthy" } else { "unhealthy" },
            "current_provider": self.current_provider().to_string(),
            "providers": providers,
            "metrics": self.metrics(),
        })
    }
}
