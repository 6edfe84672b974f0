//! TOML configuration.
//!
//! A single file (default `./config/conductor.toml`) is parsed into a
//! [`Config`] that is passed by reference into every component. Only
//! `[db].path` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/conductor.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [retrieval]
//! top_k = 5
//! hybrid_alpha = 0.7
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Collection;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults everywhere except the database location.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Chunk sizes are expressed in approximate tokens (4 chars per token).
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    /// Tail chunks smaller than this are folded into their predecessor.
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            min_tokens: default_min_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_min_tokens() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama endpoint, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
/// Model used when `[embedding].model` is omitted.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

fn default_model() -> Option<String> {
    Some(DEFAULT_EMBEDDING_MODEL.to_string())
}
fn default_dims() -> Option<usize> {
    Some(1536)
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    /// Providers that call out over HTTP and need an explicit model + dims.
    fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "gemini" | "ollama")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates fetched per collection = `top_k * overfetch_factor`.
    #[serde(default = "default_overfetch")]
    pub overfetch_factor: usize,
    /// Weight of the semantic score; the lexical score gets `1 - alpha`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_half_life")]
    pub recency_half_life_days: f64,
    #[serde(default = "default_collections")]
    pub collections: Vec<Collection>,
    /// Token budget for [`crate::answer::format_context`].
    #[serde(default = "default_context_max_tokens")]
    pub context_max_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            overfetch_factor: default_overfetch(),
            hybrid_alpha: default_hybrid_alpha(),
            recency_weight: default_recency_weight(),
            recency_half_life_days: default_half_life(),
            collections: default_collections(),
            context_max_tokens: default_context_max_tokens(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_overfetch() -> usize {
    3
}
fn default_hybrid_alpha() -> f64 {
    0.7
}
fn default_recency_weight() -> f64 {
    0.05
}
fn default_half_life() -> f64 {
    180.0
}
fn default_collections() -> Vec<Collection> {
    vec![Collection::Conversations]
}
fn default_context_max_tokens() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Conversations embedded concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Extra attempts for a batch that failed with `ProviderUnavailable`.
    #[serde(default = "default_batch_retries")]
    pub max_batch_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_batch_retries: default_batch_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_batch_retries() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "warn".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if chunking.overlap_tokens >= chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    if chunking.min_tokens > chunking.max_tokens {
        anyhow::bail!("chunking.min_tokens must be <= chunking.max_tokens");
    }

    let retrieval = &config.retrieval;
    if retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if retrieval.overfetch_factor < 1 {
        anyhow::bail!("retrieval.overfetch_factor must be >= 1");
    }
    if !(0.0..=1.0).contains(&retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&retrieval.recency_weight) {
        anyhow::bail!("retrieval.recency_weight must be in [0.0, 1.0]");
    }
    if retrieval.recency_half_life_days <= 0.0 {
        anyhow::bail!("retrieval.recency_half_life_days must be > 0");
    }
    if retrieval.collections.is_empty() {
        anyhow::bail!("retrieval.collections must name at least one collection");
    }

    let embedding = &config.embedding;
    if embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    match embedding.provider.as_str() {
        "disabled" | "openai" | "gemini" | "ollama" | "local" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, gemini, ollama, local, or hash.",
            other
        ),
    }
    if embedding.is_remote() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
    }

    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 1000);
        assert_eq!(config.chunking.overlap_tokens, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.overfetch_factor, 3);
        assert!((config.retrieval.hybrid_alpha - 0.7).abs() < 1e-9);
        assert_eq!(config.retrieval.collections, vec![Collection::Conversations]);
        assert_eq!(
            config.embedding.model.as_deref(),
            Some("text-embedding-3-small")
        );
    }

    #[test]
    fn rejects_overlap_not_smaller_than_window() {
        let err = parse(
            "[db]\npath = \"x\"\n[chunking]\nmax_tokens = 100\noverlap_tokens = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn rejects_alpha_out_of_range() {
        let err = parse("[db]\npath = \"x\"\n[retrieval]\nhybrid_alpha = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"cohere\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn remote_provider_rejects_zero_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"gemini\"\ndims = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 256\n").is_ok());
    }

    #[test]
    fn parses_collection_names() {
        let config = parse(
            "[db]\npath = \"x\"\n[retrieval]\ncollections = [\"conversations\", \"code\"]\n",
        )
        .unwrap();
        assert_eq!(
            config.retrieval.collections,
            vec![Collection::Conversations, Collection::Code]
        );
    }

    #[test]
    fn rejects_unknown_collection() {
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\ncollections = [\"notes\"]\n").is_err());
    }
}
