//! Configuration for the filing index.
//!
//! Supports both environment variables and a YAML config file.
//! Environment variables take precedence over config file values.
//! The loaded `Config` is frozen and cloned by value into every
//! component constructor.

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the LLM API (e.g., "https://api.openai.com")
    #[serde(default)]
    pub base_url: String,

    /// API key for authentication
    #[serde(default)]
    pub api_key: String,

    /// Model name (e.g., "gpt-4o", "claude-3-opus")
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Bounded retry count for transient failures
    #[serde(default = "default_llm_retries")]
    pub retries: usize,

    /// Per-call deadline in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum tokens for response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_retries() -> usize {
    10
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.0
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: default_llm_model(),
            retries: default_llm_retries(),
            timeout_secs: default_call_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service (e.g., "http://localhost:11434")
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Fixed output dimension; must match the service
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,

    /// Texts per remote embedding call
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,

    /// Per-call deadline in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_dim() -> usize {
    768
}

fn default_embed_batch_size() -> usize {
    32
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            dim: default_embedding_dim(),
            batch_size: default_embed_batch_size(),
            timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory where uploaded PDFs are kept
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/filing_index.db")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            upload_dir: default_upload_dir(),
        }
    }
}

/// Tree building configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Leading pages scanned for a table of contents
    #[serde(default = "default_toc_check_pages")]
    pub toc_check_pages: usize,

    /// Neighborhood (±pages) accepted when verifying a ToC entry's page
    #[serde(default = "default_toc_verify_window")]
    pub toc_verify_window: usize,

    /// Page span above which a leaf is subdivided
    #[serde(default = "default_max_pages_per_node")]
    pub max_pages_per_node: usize,

    /// Token count above which a leaf is subdivided
    #[serde(default = "default_max_tokens_per_node")]
    pub max_tokens_per_node: usize,

    /// Minimum accuracy score for accepting a proposed subdivision
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,
}

fn default_toc_check_pages() -> usize {
    20
}

fn default_toc_verify_window() -> usize {
    1
}

fn default_max_pages_per_node() -> usize {
    10
}

fn default_max_tokens_per_node() -> usize {
    20000
}

fn default_accuracy_threshold() -> f64 {
    0.6
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            toc_check_pages: default_toc_check_pages(),
            toc_verify_window: default_toc_verify_window(),
            max_pages_per_node: default_max_pages_per_node(),
            max_tokens_per_node: default_max_tokens_per_node(),
            accuracy_threshold: default_accuracy_threshold(),
        }
    }
}

/// Chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    /// Token overlap between consecutive chunks
    #[serde(default = "default_chunk_overlap_tokens")]
    pub overlap_tokens: usize,

    /// Chunks shorter than this are discarded
    #[serde(default = "default_chunk_min_tokens")]
    pub min_tokens: usize,
}

fn default_chunk_max_tokens() -> usize {
    512
}

fn default_chunk_overlap_tokens() -> usize {
    64
}

fn default_chunk_min_tokens() -> usize {
    32
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap_tokens(),
            min_tokens: default_chunk_min_tokens(),
        }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Token budget for the answer context
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,

    /// Nodes returned by value search per document
    #[serde(default = "default_value_search_top_k")]
    pub value_search_top_k: usize,

    /// Cap on outstanding LLM calls during retrieval fan-out
    #[serde(default = "default_retrieval_concurrency")]
    pub concurrency: usize,
}

fn default_context_budget_tokens() -> usize {
    50000
}

fn default_value_search_top_k() -> usize {
    20
}

fn default_retrieval_concurrency() -> usize {
    8
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            context_budget_tokens: default_context_budget_tokens(),
            value_search_top_k: default_value_search_top_k(),
            concurrency: default_retrieval_concurrency(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// LLM settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding service settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Tree building settings
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Chunking settings
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_BASE_URL, LLM_API_KEY, LLM_MODEL, ...)
    /// 2. Config file (~/.config/filing-index/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| IndexError::io(path, e))?;

        serde_yaml::from_str(&content)
            .map_err(|e| IndexError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Override file values with environment variables.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = env::var("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = env::var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = env::var("LLM_RETRIES") {
            if let Ok(n) = v.parse() {
                self.llm.retries = n;
            }
        }
        if let Ok(v) = env::var("EMBEDDING_URL") {
            self.embedding.url = v;
        }
        if let Ok(v) = env::var("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = env::var("EMBEDDING_DIM") {
            if let Ok(n) = v.parse() {
                self.embedding.dim = n;
            }
        }
        if let Ok(v) = env::var("DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(v);
        }
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "filing-index")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.llm.base_url.is_empty() {
            return Err(IndexError::Config(
                "LLM base URL is required. Set LLM_BASE_URL environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.model.is_empty() {
            return Err(IndexError::Config(
                "LLM model is required. Set LLM_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        if self.embedding.url.is_empty() {
            return Err(IndexError::Config(
                "Embedding service URL is required. Set EMBEDDING_URL environment variable or add to config file.".to_string()
            ));
        }

        if self.embedding.dim == 0 {
            return Err(IndexError::Config(
                "Embedding dimension must be non-zero.".to_string(),
            ));
        }

        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(IndexError::Config(
                "Chunk overlap must be smaller than chunk max tokens.".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a config from explicit LLM values (useful for testing).
    pub fn with_llm(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm: LlmConfig {
                base_url: base_url.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
