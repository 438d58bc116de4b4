//! TOML configuration.
//!
//! Every section except `[index]` and `[ingest]` has defaults, so a minimal
//! file only names where state lives and which directory to index.
//! [`load_config`] validates the result; any failure there is fatal at
//! startup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkConfig;
use crate::search::{RankingConfig, SearchMode};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// SQLite database holding chunk vectors.
    pub db_path: PathBuf,
    /// JSON file holding processing records.
    pub state_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_inflight_embeddings")]
    pub max_inflight_embeddings: usize,
    #[serde(default = "default_true")]
    pub use_revisions: bool,
    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_concurrency() -> usize {
    4
}
fn default_max_inflight_embeddings() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_storage_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_storage_timeout_secs() -> u64 {
    30
}
fn default_embed_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_target_size() -> usize {
    1200
}
fn default_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
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
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_mode")]
    pub default_mode: String,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default)]
    pub similarity_threshold: f32,
    #[serde(default = "default_title_boost")]
    pub title_boost: f32,
    #[serde(default = "default_recency_floor")]
    pub recency_floor: f32,
    #[serde(default = "default_recency_window_days")]
    pub recency_window_days: u32,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
    #[serde(default = "default_snippet_max_len")]
    pub snippet_max_len: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            default_mode: default_mode(),
            overfetch_factor: default_overfetch_factor(),
            similarity_threshold: 0.0,
            title_boost: default_title_boost(),
            recency_floor: default_recency_floor(),
            recency_window_days: default_recency_window_days(),
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            snippet_max_len: default_snippet_max_len(),
        }
    }
}

fn default_final_limit() -> usize {
    10
}
fn default_mode() -> String {
    "semantic".to_string()
}
fn default_overfetch_factor() -> usize {
    3
}
fn default_title_boost() -> f32 {
    1.2
}
fn default_recency_floor() -> f32 {
    0.4
}
fn default_recency_window_days() -> u32 {
    365
}
fn default_semantic_weight() -> f32 {
    0.7
}
fn default_keyword_weight() -> f32 {
    0.3
}
fn default_snippet_max_len() -> usize {
    240
}

impl Config {
    pub fn chunk_config(&self) -> crate::error::Result<ChunkConfig> {
        ChunkConfig::new(self.chunking.target_size, self.chunking.overlap)
    }

    pub fn ranking(&self) -> RankingConfig {
        let r = &self.retrieval;
        RankingConfig {
            default_k: r.final_limit,
            default_mode: self.default_mode(),
            similarity_threshold: r.similarity_threshold,
            overfetch_factor: r.overfetch_factor,
            title_boost: r.title_boost,
            recency_floor: r.recency_floor,
            recency_window_days: r.recency_window_days,
            semantic_weight: r.semantic_weight,
            keyword_weight: r.keyword_weight,
            snippet_max_len: r.snippet_max_len,
        }
    }

    pub fn default_mode(&self) -> SearchMode {
        self.retrieval
            .default_mode
            .parse()
            .unwrap_or(SearchMode::Semantic)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.storage_timeout_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.embed_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    config.chunk_config()?;

    let ingest = &config.ingest;
    if ingest.concurrency == 0 {
        bail!("ingest.concurrency must be >= 1");
    }
    if ingest.max_inflight_embeddings == 0 {
        bail!("ingest.max_inflight_embeddings must be >= 1");
    }

    let r = &config.retrieval;
    if r.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if !(1..=10).contains(&r.overfetch_factor) {
        bail!("retrieval.overfetch_factor must be in [1, 10]");
    }
    if !(0.0..=1.0).contains(&r.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&r.recency_floor) {
        bail!("retrieval.recency_floor must be in [0.0, 1.0]");
    }
    if r.recency_window_days == 0 {
        bail!("retrieval.recency_window_days must be > 0");
    }
    if r.title_boost <= 0.0 {
        bail!("retrieval.title_boost must be > 0");
    }
    if r.semantic_weight < 0.0
        || r.keyword_weight < 0.0
        || r.semantic_weight + r.keyword_weight <= 0.0
    {
        bail!("retrieval.semantic_weight and keyword_weight must be >= 0 with a positive sum");
    }
    if r.default_mode.parse::<SearchMode>().is_err() {
        bail!(
            "Unknown retrieval.default_mode: '{}'. Must be semantic or hybrid.",
            r.default_mode
        );
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "hashing" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, or ollama.",
            other
        ),
    }
    if e.is_enabled() && e.provider != "hashing" {
        if e.dims.is_none() || e.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                e.provider
            );
        }
    }
    if e.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if e.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    Ok(())
}
