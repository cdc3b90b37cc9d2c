//! Local inference via fastembed.
//!
//! The model is downloaded from Hugging Face on first use and cached; after
//! that no network calls are made. Inference runs on the blocking pool.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{Embedder, EmbeddingRequest};
use crate::config::EmbeddingConfig;
use crate::error::ProviderError;

/// Embedding provider running a fastembed model in-process.
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<Mutex<fastembed::TextEmbedding>>,
}

impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-large-en-v1.5".to_string());
        let (fastembed_model, dims) = config_to_fastembed_model(&model_name)?;

        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn config_to_fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    match name {
        "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((fastembed::EmbeddingModel::BGELargeENV15, 1024)),
        "multilingual-e5-large" => Ok((fastembed::EmbeddingModel::MultilingualE5Large, 1024)),
        "mxbai-embed-large-v1" => Ok((fastembed::EmbeddingModel::MxbaiEmbedLargeV1, 1024)),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             multilingual-e5-large, mxbai-embed-large-v1",
            other
        ),
    }
}

#[async_trait]
impl Embedder for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
        let model = Arc::clone(&self.model);
        let input = request.input.to_string();

        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| ProviderError::Request("local model lock poisoned".to_string()))?;
            let mut out = model
                .embed(vec![input], None)
                .map_err(|e| ProviderError::Request(format!("local embedding failed: {}", e)))?;
            out.pop()
                .ok_or_else(|| ProviderError::Malformed("empty local embedding output".to_string()))
        })
        .await
        .map_err(|e| ProviderError::Request(format!("local embedding task failed: {}", e)))?
    }
}
