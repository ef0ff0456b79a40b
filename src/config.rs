//! TOML configuration parsing and validation.
//!
//! Every component receives its own slice of [`Config`] through its
//! constructor; nothing in the pipeline reads configuration from globals.
//! API keys are the single exception and are read from the environment by
//! the HTTP providers when they are constructed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Worker pool size for batch embedding.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: default_dims(),
            url: None,
            timeout_secs: default_embed_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            concurrency: default_concurrency(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    6
}
fn default_base_delay_ms() -> u64 {
    600
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_concurrency() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Token budget for search answers.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Token budget for the mining call, which returns a whole JSON document.
    #[serde(default = "default_mining_max_tokens")]
    pub mining_max_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            timeout_secs: default_completion_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            mining_max_tokens: default_mining_max_tokens(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    800
}
fn default_mining_max_tokens() -> u32 {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            threshold: default_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_threshold() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Rows per bulk insert.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

fn default_insert_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct MiningConfig {
    /// Offset of the tenant's business day from UTC; decides where "today" starts.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_knowledge_context_limit")]
    pub knowledge_context_limit: usize,
    #[serde(default = "default_max_questions")]
    pub max_questions: usize,
    #[serde(default = "default_unanswered_cap")]
    pub unanswered_cap: usize,
    #[serde(default = "default_repeated_cap")]
    pub repeated_cap: usize,
    #[serde(default = "default_singleton_cap")]
    pub singleton_cap: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            knowledge_context_limit: default_knowledge_context_limit(),
            max_questions: default_max_questions(),
            unanswered_cap: default_unanswered_cap(),
            repeated_cap: default_repeated_cap(),
            singleton_cap: default_singleton_cap(),
        }
    }
}

fn default_knowledge_context_limit() -> usize {
    40
}
fn default_max_questions() -> usize {
    200
}
fn default_unanswered_cap() -> usize {
    100
}
fn default_repeated_cap() -> usize {
    50
}
fn default_singleton_cap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// A config with every section at its default, rooted at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            completion: CompletionConfig::default(),
            retrieval: RetrievalConfig::default(),
            indexing: IndexingConfig::default(),
            mining: MiningConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    let emb = &config.embedding;
    match emb.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if emb.is_enabled() {
        if emb.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", emb.provider);
        }
        if emb.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                emb.provider
            );
        }
    }
    if emb.max_attempts == 0 {
        anyhow::bail!("embedding.max_attempts must be >= 1");
    }
    if emb.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be >= 1");
    }
    if emb.max_delay_ms < emb.base_delay_ms {
        anyhow::bail!("embedding.max_delay_ms must be >= embedding.base_delay_ms");
    }

    let comp = &config.completion;
    match comp.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if comp.is_enabled() && comp.model.is_none() {
        anyhow::bail!(
            "completion.model must be specified when provider is '{}'",
            comp.provider
        );
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.threshold) {
        anyhow::bail!("retrieval.threshold must be in [-1.0, 1.0]");
    }

    if config.indexing.insert_batch_size == 0 {
        anyhow::bail!("indexing.insert_batch_size must be >= 1");
    }

    let mining = &config.mining;
    if mining.max_questions == 0
        || mining.unanswered_cap == 0
        || mining.repeated_cap == 0
        || mining.singleton_cap == 0
    {
        anyhow::bail!("mining question caps must all be >= 1");
    }
    if mining.utc_offset_minutes.abs() >= 24 * 60 {
        anyhow::bail!("mining.utc_offset_minutes must be within one day");
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
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"data/faq.sqlite\"\n").unwrap();
        assert_eq!(config.embedding.dims, 1536);
        assert_eq!(config.embedding.max_attempts, 6);
        assert_eq!(config.embedding.base_delay_ms, 600);
        assert_eq!(config.embedding.max_delay_ms, 8000);
        assert_eq!(config.embedding.concurrency, 3);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.indexing.insert_batch_size, 100);
        assert_eq!(config.mining.knowledge_context_limit, 40);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_enabled_embedding_requires_model() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[db]\npath = \"x\"\n[completion]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown completion provider"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nconcurrency = 0\n").unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_delay_cap_below_base_rejected() {
        let err = parse(
            "[db]\npath = \"x\"\n[embedding]\nbase_delay_ms = 1000\nmax_delay_ms = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"));
    }
}
