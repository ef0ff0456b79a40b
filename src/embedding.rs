//! Embedding provider abstraction and the retrying embedding client.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]** — calls an OpenAI-compatible `/embeddings` endpoint.
//!
//! Providers make exactly one upstream call per request and classify the
//! outcome into a [`ProviderError`]. Retrying, validation, and bounded
//! parallelism live in [`EmbeddingClient`].
//!
//! # Retry Strategy
//!
//! - [`ProviderError::RateLimited`] and [`ProviderError::Timeout`] → retry
//! - [`ProviderError::Other`] → fail immediately
//! - Backoff before retry `n` (0-based): `min(max_delay, base_delay × 2ⁿ) + jitter`
//! - After `max_attempts` calls the last error is returned
//!
//! Also provides vector utilities used by the stores:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian `f32` BLOB encoding

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, ProviderError};

/// A single-text embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed one text with a single upstream call.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Other(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using an OpenAI-compatible API.
///
/// Calls `POST {url}/embeddings`. Requires `OPENAI_API_KEY` in the
/// environment. The request timeout comes from `embedding.timeout_secs`;
/// an elapsed timeout surfaces as [`ProviderError::Timeout`].
pub struct OpenAIProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base),
            api_key,
            model,
            dims: config.dims,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: self.dims,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body_text));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Other(format!("invalid embeddings response: {}", e))
            }
        })?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Other("embeddings response had no data".to_string()))
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Retry policy ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total upstream calls allowed, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 600,
            max_delay_ms: 8000,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_ms: config.jitter_ms,
        }
    }

    /// Deterministic part of the delay before retry `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Full delay before retry `retry`: backoff plus uniform jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(jitter)
    }
}

// ============ Embedding client ============

/// Produces validated embeddings with retry/backoff and bounded parallelism.
///
/// Cheap to clone; clones share the provider.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    dims: usize,
    retry: RetryPolicy,
    concurrency: usize,
}

impl EmbeddingClient {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        dims: usize,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            dims,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Embed one text, retrying rate-limit and timeout failures.
    ///
    /// The returned vector always has exactly the configured number of finite
    /// components.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut retry = 0u32;
        loop {
            match self.provider.embed(text).await {
                Ok(vector) => {
                    validate_embedding(&vector, self.dims)?;
                    return Ok(vector);
                }
                Err(err) if err.is_retryable() && retry + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(retry);
                    warn!(
                        model = self.provider.model_name(),
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "embedding call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Embed many texts with the configured concurrency. Output order
    /// matches input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.embed_batch_with(texts, self.concurrency).await
    }

    /// Embed many texts with a pool of `concurrency` workers.
    ///
    /// Workers pull the next index from a shared atomic cursor and write
    /// each result into its own pre-allocated slot, so completion order
    /// never affects output order. The first failure stops workers from
    /// taking new items and is returned.
    pub async fn embed_batch_with(
        &self,
        texts: &[String],
        concurrency: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Arc<Vec<String>> = Arc::new(texts.to_vec());
        let slots: Arc<Vec<OnceLock<Vec<f32>>>> =
            Arc::new((0..texts.len()).map(|_| OnceLock::new()).collect());
        let cursor = Arc::new(AtomicUsize::new(0));
        let halted = Arc::new(AtomicBool::new(false));

        let workers = concurrency.max(1).min(texts.len());
        debug!(items = texts.len(), workers, "batch embedding");

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let client = self.clone();
            let inputs = Arc::clone(&inputs);
            let slots = Arc::clone(&slots);
            let cursor = Arc::clone(&cursor);
            let halted = Arc::clone(&halted);

            pool.spawn(async move {
                loop {
                    if halted.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    let idx = cursor.fetch_add(1, Ordering::AcqRel);
                    let Some(text) = inputs.get(idx) else {
                        return Ok(());
                    };
                    match client.embed(text).await {
                        Ok(vector) => {
                            let _ = slots[idx].set(vector);
                        }
                        Err(err) => {
                            halted.store(true, Ordering::Release);
                            return Err(err);
                        }
                    }
                }
            });
        }

        let mut first_err = None;
        while let Some(joined) = pool.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(EmbeddingError::Provider(ProviderError::Other(format!(
                    "embedding worker failed: {}",
                    e
                ))))
            });
            if let Err(err) = outcome {
                first_err.get_or_insert(err);
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let slots = Arc::try_unwrap(slots).map_err(|_| {
            EmbeddingError::Provider(ProviderError::Other(
                "embedding workers still hold the output buffer".to_string(),
            ))
        })?;

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.into_inner().ok_or_else(|| {
                    EmbeddingError::Provider(ProviderError::Other(format!(
                        "no embedding produced for item {}",
                        idx
                    )))
                })
            })
            .collect()
    }
}

/// Reject vectors with the wrong length or any NaN/infinite component.
pub fn validate_embedding(vector: &[f32], dims: usize) -> Result<(), EmbeddingError> {
    if vector.len() != dims {
        return Err(EmbeddingError::InvalidShape {
            expected: dims,
            actual: vector.len(),
        });
    }
    if let Some(index) = vector.iter().position(|v| !v.is_finite()) {
        return Err(EmbeddingError::NonFinite { index });
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use faq_harness::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
