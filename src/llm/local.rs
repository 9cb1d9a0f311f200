//! In-process generation provider
//!
//! Loads a GGUF quantized LLaMA-family model with candle and generates
//! token-by-token. Streaming decodes incrementally so each chunk is the text
//! delta of one sampled token. Generation runs on a blocking thread; the
//! model is serialized behind a mutex because the KV cache is per-call
//! state.

use super::{GenerationOptions, LlmClient, LlmProvider, LlmResponse, TokenStream};
use crate::config::LocalModelConfig;
use crate::error::{LlmError, RagError, Result};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tokio::time::timeout;
use tracing::{debug, info};

struct ModelInner {
    model: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token: Option<u32>,
}

/// In-process GGUF model client
pub struct LocalModelClient {
    inner: Arc<std::sync::Mutex<ModelInner>>,
    model_name: String,
    max_length: usize,
}

/// Find the GGUF file at the configured path
fn find_gguf(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let candidate = entry.path();
            if candidate.extension().and_then(|s| s.to_str()) == Some("gguf") {
                return Ok(candidate);
            }
        }
    }
    Err(RagError::NotFound(format!(
        "No GGUF model found at {}",
        path.display()
    )))
}

/// Locate the EOS token id from common vocabulary entries
fn find_eos_token(tokenizer: &Tokenizer) -> Option<u32> {
    ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"]
        .iter()
        .find_map(|candidate| tokenizer.token_to_id(candidate))
}

/// Softmax over raw logits
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&x| x / sum).collect()
}

/// Index of the maximum logit
fn argmax(values: &[f32]) -> Result<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .ok_or_else(|| RagError::Internal("Empty logits vector".to_string()))
}

/// Sample the next token: greedy at temperature 0, multinomial otherwise
fn sample_token(logits: &Tensor, temperature: f32) -> Result<u32> {
    let mut logits_vec = logits
        .to_vec1::<f32>()
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;

    if temperature <= 0.0 {
        return Ok(argmax(&logits_vec)? as u32);
    }

    for logit in &mut logits_vec {
        *logit /= temperature;
    }
    let probs = softmax(&logits_vec);

    use rand::Rng;
    let r: f32 = rand::thread_rng().gen();
    let mut cumulative = 0.0f32;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return Ok(idx as u32);
        }
    }
    Ok(argmax(&probs)? as u32)
}

/// Run a full generation, emitting each decoded text delta through `emit`.
/// Returns (prompt_tokens, generated_tokens). Emission returning false stops
/// the loop within one token.
fn run_generation(
    inner: &mut ModelInner,
    prompt: &str,
    options: &GenerationOptions,
    max_length: usize,
    mut emit: impl FnMut(String) -> bool,
) -> Result<(usize, usize)> {
    let encoding = inner
        .tokenizer
        .encode(prompt, true)
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
    let prompt_ids: Vec<u32> = encoding.get_ids().to_vec();

    if prompt_ids.is_empty() {
        return Err(RagError::InvalidInput("Empty prompt".to_string()));
    }

    let budget = (options.max_tokens as usize).min(max_length.saturating_sub(prompt_ids.len()));

    let input = Tensor::new(prompt_ids.as_slice(), &inner.device)
        .and_then(|t| t.unsqueeze(0))
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
    let logits = inner
        .model
        .forward(&input, 0)
        .and_then(|t| t.squeeze(0))
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;

    let mut generated: Vec<u32> = Vec::new();
    let mut decoded_len = 0usize;
    let mut next = sample_token(&logits, options.temperature)?;

    for step in 0..budget {
        if Some(next) == inner.eos_token {
            break;
        }
        generated.push(next);

        let text = inner
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
        // Hold back while the tail is an incomplete multi-byte sequence
        if text.len() > decoded_len && !text.ends_with('\u{FFFD}') {
            let delta = text[decoded_len..].to_string();
            decoded_len = text.len();
            if !emit(delta) {
                break;
            }
        }

        if step + 1 == budget {
            break;
        }

        let input = Tensor::new(&[next], &inner.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
        let position = prompt_ids.len() + generated.len() - 1;
        let logits = inner
            .model
            .forward(&input, position)
            .and_then(|t| t.squeeze(0))
            .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
        next = sample_token(&logits, options.temperature)?;
    }

    Ok((prompt_ids.len(), generated.len()))
}

impl LocalModelClient {
    /// Load the model and tokenizer from disk
    pub async fn load(config: &LocalModelConfig) -> Result<Self> {
        let model_path = PathBuf::from(&config.model_path);
        let max_length = config.max_length;

        let inner = tokio::task::spawn_blocking(move || -> Result<(ModelInner, String)> {
            let gguf_path = find_gguf(&model_path)?;
            info!("Loading GGUF model: {}", gguf_path.display());

            let mut file = std::fs::File::open(&gguf_path)?;
            let content = gguf_file::Content::read(&mut file)
                .map_err(|e| LlmError::GenerationFailed(format!("GGUF read failed: {e}")))?;

            let device = Device::Cpu;
            let model = ModelWeights::from_gguf(content, &mut file, &device)
                .map_err(|e| LlmError::GenerationFailed(format!("Model load failed: {e}")))?;

            let tokenizer_path = gguf_path
                .parent()
                .map(|dir| dir.join("tokenizer.json"))
                .filter(|p| p.exists())
                .ok_or_else(|| {
                    RagError::NotFound(format!(
                        "tokenizer.json not found next to {}",
                        gguf_path.display()
                    ))
                })?;
            let tokenizer = Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| LlmError::GenerationFailed(format!("Tokenizer load failed: {e}")))?;

            let eos_token = find_eos_token(&tokenizer);
            let model_name = gguf_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("local-gguf")
                .to_string();

            Ok((
                ModelInner {
                    model,
                    tokenizer,
                    device,
                    eos_token,
                },
                model_name,
            ))
        })
        .await
        .map_err(|e| RagError::Internal(e.to_string()))??;

        let (inner, model_name) = inner;
        info!("In-process model '{}' ready", model_name);

        Ok(Self {
            inner: Arc::new(std::sync::Mutex::new(inner)),
            model_name,
            max_length,
        })
    }
}

#[async_trait]
impl LlmClient for LocalModelClient {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<LlmResponse> {
        let start = Instant::now();
        let inner = self.inner.clone();
        let prompt = prompt.to_string();
        let opts = options.clone();
        let max_length = self.max_length;

        let handle = tokio::task::spawn_blocking(move || -> Result<(String, usize, usize)> {
            let mut guard = inner
                .lock()
                .map_err(|_| RagError::Internal("Model mutex poisoned".to_string()))?;
            let mut text = String::new();
            let (prompt_tokens, generated) =
                run_generation(&mut guard, &prompt, &opts, max_length, |delta| {
                    text.push_str(&delta);
                    true
                })?;
            Ok((text, prompt_tokens, generated))
        });

        let (text, prompt_tokens, generated) = timeout(options.timeout, handle)
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| RagError::Internal(e.to_string()))??;

        debug!("Local generation produced {} tokens", generated);

        Ok(LlmResponse {
            text,
            provider: LlmProvider::Local,
            model_name: self.model_name.clone(),
            tokens_used: Some(generated as u32),
            prompt_tokens: Some(prompt_tokens as u32),
            response_time: start.elapsed().as_secs_f64(),
            metadata: HashMap::new(),
        })
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let inner = self.inner.clone();
        let prompt = prompt.to_string();
        let opts = options.clone();
        let max_length = self.max_length;
        let chunk_timeout = options.timeout;

        let (tx, rx) = flume::unbounded::<Result<String>>();

        tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<()> {
                let mut guard = inner
                    .lock()
                    .map_err(|_| RagError::Internal("Model mutex poisoned".to_string()))?;
                run_generation(&mut guard, &prompt, &opts, max_length, |delta| {
                    // A dropped receiver means the consumer cancelled
                    tx.send(Ok(delta)).is_ok()
                })?;
                Ok(())
            })();

            if let Err(e) = result {
                let _ = tx.send(Err(e));
            }
        });

        let stream = async_stream::try_stream! {
            let mut incoming = rx.into_stream();
            loop {
                let next = timeout(chunk_timeout, futures::StreamExt::next(&mut incoming))
                    .await
                    .map_err(|_| RagError::from(LlmError::Timeout))?;
                let Some(item) = next else { break };
                let chunk = item?;
                yield chunk;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn probe(&self) -> Result<()> {
        // The model is memory-resident once constructed
        Ok(())
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Local
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1]);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.5, 0.3]).unwrap(), 1);
        assert!(argmax(&[]).is_err());
    }

    #[test]
    fn test_greedy_sampling_is_argmax() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0.1f32, 3.0, 0.2], &device).unwrap();
        assert_eq!(sample_token(&logits, 0.0).unwrap(), 1);
    }

    #[test]
    fn test_find_gguf_missing_path() {
        let result = find_gguf(Path::new("/nonexistent/model.gguf"));
        assert!(matches!(result, Err(RagError::NotFound(_))));
    }

    #[test]
    fn test_find_gguf_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weights.gguf"), b"stub").unwrap();
        let found = find_gguf(dir.path()).unwrap();
        assert_eq!(found.extension().and_then(|s| s.to_str()), Some("gguf"));
    }
}
