//! Embedding provider abstraction and the per-record embedding client.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` with a fixed `dimensions` parameter.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: fastembed inference, behind the `local-embeddings-fastembed` feature.
//!
//! [`EmbeddingClient`] sits in front of whichever provider is configured. It
//! cuts the input to a fixed character budget, bounds the call with a
//! timeout, and rejects vectors of the wrong length, so every stored vector
//! is comparable under one similarity metric.
//!
//! # Truncation
//!
//! Input longer than `max_input_chars` is cut to its first `max_input_chars`
//! characters (never mid-codepoint). The cut is a pure function of the text,
//! so the same oversized record always sends the same prefix.

#[cfg(feature = "local-embeddings-fastembed")]
mod local_fastembed;
mod remote;

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::ProviderError;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local_fastembed::LocalProvider;
pub use remote::{OllamaProvider, OpenAIProvider};

/// One call to the embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    /// Already truncated to the client's character budget.
    pub input: &'a str,
    pub dims: usize,
}

/// Trait for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-large"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1024`).
    fn dims(&self) -> usize;
    /// Embed one input. Must not retry beyond the provider's own transport policy.
    async fn embed(&self, request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl Embedder for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Client ============

/// Wraps a provider with truncation, a per-call timeout, and a dimension check.
pub struct EmbeddingClient {
    provider: Box<dyn Embedder>,
    dims: usize,
    max_input_chars: usize,
    call_timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(
        provider: Box<dyn Embedder>,
        dims: usize,
        max_input_chars: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            dims,
            max_input_chars,
            call_timeout,
        }
    }

    /// Build the client for the configured provider.
    ///
    /// # Errors
    ///
    /// Fails when the provider is disabled or cannot be initialized, or when
    /// its native dimensionality disagrees with `embedding.dims`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        if !config.is_enabled() {
            bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        }
        let provider = create_provider(config)?;
        if provider.dims() != config.dims {
            bail!(
                "provider '{}' produces {} dimensions but embedding.dims = {}",
                provider.model_name(),
                provider.dims(),
                config.dims
            );
        }
        Ok(Self::new(
            provider,
            config.dims,
            config.max_input_chars,
            call_budget(config),
        ))
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// The request that would be sent for `text`.
    pub fn request<'a>(&'a self, text: &'a str) -> EmbeddingRequest<'a> {
        EmbeddingRequest {
            model: self.provider.model_name(),
            input: truncate_chars(text, self.max_input_chars),
            dims: self.dims,
        }
    }

    /// Embed one context blob.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = self.request(text);
        if request.input.trim().is_empty() {
            return Err(ProviderError::EmptyInput);
        }

        let vector = tokio::time::timeout(self.call_timeout, self.provider.embed(&request))
            .await
            .map_err(|_| ProviderError::Timeout(self.call_timeout))??;

        if vector.len() != self.dims {
            return Err(ProviderError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ProviderError::Malformed(
                "embedding contains non-finite values".to_string(),
            ));
        }
        Ok(vector)
    }
}

/// Upper bound for one `embed` call, covering transport retries and their backoff.
fn call_budget(config: &EmbeddingConfig) -> Duration {
    let attempts = u64::from(config.max_retries) + 1;
    let backoff: u64 = (1..=u64::from(config.max_retries))
        .map(|attempt| 1u64 << (attempt - 1).min(5))
        .sum();
    Duration::from_secs(config.timeout_secs * attempts + backoff)
}

/// Cut `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use crm_vectorize::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every input it is asked to embed and answers with a fixed vector.
    struct Recording {
        dims: usize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Embedder for Recording {
        fn model_name(&self) -> &str {
            "recording"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
            self.seen.lock().unwrap().push(request.input.to_string());
            Ok(vec![0.25; self.dims])
        }
    }

    struct Hanging;

    #[async_trait]
    impl Embedder for Hanging {
        fn model_name(&self) -> &str {
            "hanging"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![0.0; 4])
        }
    }

    #[test]
    fn truncate_is_a_prefix_cut() {
        assert_eq!(truncate_chars("hello world", 5), "hello");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let cut = truncate_chars(text, 2);
        assert_eq!(cut, "hé");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[tokio::test]
    async fn oversized_input_sends_identical_prefix_every_time() {
        let long = "word ".repeat(5_000);
        let client = EmbeddingClient::new(
            Box::new(Recording {
                dims: 8,
                seen: Mutex::new(Vec::new()),
            }),
            8,
            8000,
            Duration::from_secs(5),
        );

        let first = client.request(&long).input.to_string();
        let second = client.request(&long).input.to_string();
        assert_eq!(first.chars().count(), 8000);
        assert_eq!(first, second);
        assert!(long.starts_with(&first));

        let v = client.embed(&long).await.unwrap();
        assert_eq!(v.len(), 8);
    }

    #[tokio::test]
    async fn wrong_dimension_is_a_provider_error() {
        let client = EmbeddingClient::new(
            Box::new(Recording {
                dims: 3,
                seen: Mutex::new(Vec::new()),
            }),
            1024,
            8000,
            Duration::from_secs(5),
        );
        let err = client.embed("some text").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::DimensionMismatch {
                expected: 1024,
                got: 3
            }
        ));
    }

    #[tokio::test]
    async fn empty_input_never_reaches_provider() {
        let provider = Recording {
            dims: 4,
            seen: Mutex::new(Vec::new()),
        };
        let client = EmbeddingClient::new(Box::new(provider), 4, 8000, Duration::from_secs(5));
        let err = client.embed("   \n ").await.unwrap_err();
        assert!(matches!(err, ProviderError::EmptyInput));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let client = EmbeddingClient::new(Box::new(Hanging), 4, 8000, Duration::from_millis(20));
        let err = client.embed("text").await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn disabled_provider_fails() {
        let client = EmbeddingClient::new(Box::new(DisabledProvider), 4, 8000, Duration::from_secs(1));
        assert!(matches!(
            client.embed("text").await.unwrap_err(),
            ProviderError::Disabled
        ));
    }

    #[test]
    fn from_config_rejects_disabled() {
        let err = EmbeddingClient::from_config(&EmbeddingConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn call_budget_covers_retries() {
        let mut cfg = EmbeddingConfig::default();
        assert_eq!(call_budget(&cfg), Duration::from_secs(30));
        cfg.max_retries = 2;
        // 3 attempts × 30s + 1s + 2s backoff
        assert_eq!(call_budget(&cfg), Duration::from_secs(93));
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }
}
