//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/crm.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-large"
//! dims = 1024
//!
//! [pipeline]
//! batch_limit = 500
//! status_every = 25
//!
//! [pacing]
//! strategy = "fixed"
//! delay_ms = 75
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL override (Ollama host, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1024
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_status_every")]
    pub status_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            status_every: default_status_every(),
        }
    }
}

fn default_batch_limit() -> usize {
    500
}
fn default_status_every() -> u64 {
    25
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PacingStrategy {
    Fixed,
    TokenBucket,
    Adaptive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PacingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: PacingStrategy,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            delay_ms: default_delay_ms(),
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Slowest accepted token-bucket rate: one call every ~17 minutes.
pub const MIN_RATE_PER_SEC: f64 = 0.001;

fn default_strategy() -> PacingStrategy {
    PacingStrategy::Fixed
}
fn default_delay_ms() -> u64 {
    75
}
fn default_rate_per_sec() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    1
}
fn default_max_backoff_ms() -> u64 {
    5_000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate embedding
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.max_input_chars == 0 {
        bail!("embedding.max_input_chars must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Validate pipeline
    if config.pipeline.batch_limit == 0 {
        bail!("pipeline.batch_limit must be >= 1");
    }
    if config.pipeline.status_every == 0 {
        bail!("pipeline.status_every must be >= 1");
    }

    // Validate pacing
    if config.pacing.strategy == PacingStrategy::TokenBucket {
        let rate = config.pacing.rate_per_sec;
        if !rate.is_finite() || rate < MIN_RATE_PER_SEC {
            bail!(
                "pacing.rate_per_sec must be a finite value >= {} for the token_bucket strategy",
                MIN_RATE_PER_SEC
            );
        }
        if config.pacing.burst == 0 {
            bail!("pacing.burst must be >= 1");
        }
    }
    if config.pacing.strategy == PacingStrategy::Adaptive
        && config.pacing.max_backoff_ms < config.pacing.delay_ms
    {
        bail!("pacing.max_backoff_ms must be >= pacing.delay_ms");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_reference_defaults() {
        let cfg = parse_config("[db]\npath = \"crm.sqlite\"\n").unwrap();
        assert_eq!(cfg.embedding.provider, "disabled");
        assert_eq!(cfg.embedding.dims, 1024);
        assert_eq!(cfg.embedding.max_input_chars, 8000);
        assert_eq!(cfg.embedding.max_retries, 0);
        assert_eq!(cfg.pipeline.batch_limit, 500);
        assert_eq!(cfg.pipeline.status_every, 25);
        assert_eq!(cfg.pacing.strategy, PacingStrategy::Fixed);
        assert_eq!(cfg.pacing.delay_ms, 75);
    }

    #[test]
    fn remote_provider_requires_model() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"cohere\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn zero_batch_limit_rejected() {
        let err = parse_config("[db]\npath = \"x\"\n[pipeline]\nbatch_limit = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_limit"));
    }

    #[test]
    fn token_bucket_rejects_vanishing_rate() {
        for rate in ["1e-20", "0.0", "-2.0", "nan"] {
            let err = parse_config(&format!(
                "[db]\npath = \"x\"\n[pacing]\nstrategy = \"token_bucket\"\nrate_per_sec = {}\nburst = 1\n",
                rate
            ))
            .unwrap_err();
            assert!(err.to_string().contains("rate_per_sec"), "rate {} accepted", rate);
        }
    }

    #[test]
    fn token_bucket_parses() {
        let cfg = parse_config(
            "[db]\npath = \"x\"\n[pacing]\nstrategy = \"token_bucket\"\nrate_per_sec = 5.0\nburst = 3\n",
        )
        .unwrap();
        assert_eq!(cfg.pacing.strategy, PacingStrategy::TokenBucket);
        assert_eq!(cfg.pacing.burst, 3);
    }
}
