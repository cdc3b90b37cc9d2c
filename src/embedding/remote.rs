//! HTTP embedding providers: OpenAI (and compatible gateways) and Ollama.
//!
//! Transport retry uses exponential backoff and is off by default
//! (`embedding.max_retries = 0`):
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{Embedder, EmbeddingRequest};
use crate::config::EmbeddingConfig;
use crate::error::ProviderError;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// POST `body` to `url`, retrying transient failures up to `max_retries` times.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value, ProviderError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        ProviderError::Malformed(format!("response is not JSON: {}", e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = ProviderError::Status {
                    status: status.as_u16(),
                    body: body_text,
                };

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(ProviderError::from(e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ProviderError::Request("embedding failed after retries".into())))
}

fn parse_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>, ProviderError> {
    let array = value
        .as_array()
        .ok_or_else(|| ProviderError::Malformed(format!("{} is not an array", what)))?;

    array
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::Malformed(format!("{} holds a non-number", what)))
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {url}/v1/embeddings` with the configured model and an explicit
/// `dimensions` so shortened `text-embedding-3-*` vectors match `embedding.dims`.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);

        Ok(Self {
            model,
            dims: config.dims,
            endpoint: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": request.model,
            "input": request.input,
            "dimensions": request.dims,
        });
        let json = post_with_retry(
            &self.client,
            &self.endpoint,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[0].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let first = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .ok_or_else(|| ProviderError::Malformed("missing data array".to_string()))?;

    let embedding = first
        .get("embedding")
        .ok_or_else(|| ProviderError::Malformed("missing embedding".to_string()))?;

    parse_vector(embedding, "embedding")
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
/// Ollama has no output-dimension parameter; the model itself must produce
/// `embedding.dims` values, which the client verifies.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);

        Ok(Self {
            model,
            dims: config.dims,
            endpoint: format!("{}/api/embed", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": request.model,
            "input": request.input,
        });
        let json = post_with_retry(&self.client, &self.endpoint, None, &body, self.max_retries)
            .await
            .map_err(|e| match e {
                ProviderError::Request(msg) => ProviderError::Request(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.endpoint, msg
                )),
                other => other,
            })?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| ProviderError::Malformed("missing embeddings array".to_string()))?;

    parse_vector(first, "embedding")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_response_parses_first_embedding() {
        let body = json!({
            "object": "list",
            "data": [{"object": "embedding", "index": 0, "embedding": [0.5, -1.0, 2.0]}],
            "model": "text-embedding-3-large"
        });
        assert_eq!(parse_openai_response(&body).unwrap(), vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn openai_response_without_data_is_malformed() {
        let err = parse_openai_response(&json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));

        let err = parse_openai_response(&json!({"data": []})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn non_numeric_values_are_malformed() {
        let body = json!({"data": [{"embedding": [0.1, "x"]}]});
        assert!(matches!(
            parse_openai_response(&body).unwrap_err(),
            ProviderError::Malformed(_)
        ));
    }

    #[test]
    fn ollama_response_parses() {
        let body = json!({"model": "mxbai-embed-large", "embeddings": [[0.1, 0.2]]});
        let v = parse_ollama_response(&body).unwrap();
        assert_eq!(v.len(), 2);
        assert!((v[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn ollama_endpoint_uses_configured_url() {
        let cfg = EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("mxbai-embed-large".to_string()),
            url: Some("http://gpu-box:11434/".to_string()),
            ..EmbeddingConfig::default()
        };
        let p = OllamaProvider::new(&cfg).unwrap();
        assert_eq!(p.endpoint, "http://gpu-box:11434/api/embed");
        assert_eq!(p.dims(), 1024);
    }
}
