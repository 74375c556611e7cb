
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;
use crate::index::DistanceMetric;

/// Overrides the base directory, mostly useful for tests and containers.
pub const HOME_ENV_VAR: &str = "CONVO_INDEX_HOME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "bge-m3:latest".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_seconds: 30,
        }
    }
}

/// Settings for the on-disk similarity indexes and the pipeline around them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory under the base dir holding one artifact per group and type
    pub directory: String,
    pub metric: DistanceMetric,
    /// Lower bound on k for nearest-neighbor queries
    pub min_search_k: usize,
    /// Entities embedded concurrently during a batch
    pub batch_concurrency: usize,
    /// Attempts for a write section that hits SQLite lock contention
    pub max_write_retries: u32,
    pub summary_max_chars: usize,
    /// Working copies kept in memory before the least recently used clean
    /// ones are dropped
    pub max_cached_indexes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: "vector_indexes".to_string(),
            metric: DistanceMetric::L2,
            min_search_k: 100,
            batch_concurrency: 4,
            max_write_retries: 3,
            summary_max_chars: 1000,
            max_cached_indexes: 64,
        }
    }
}

/// Post-processing applied to ranked search candidates before paging.
/// The defaults leave plain nearest-neighbor order untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates farther than this distance are dropped
    pub similarity_threshold: Option<f32>,
    pub vector_weight: f32,
    /// Weight of the query's keyword overlap with the entry summary. Zero
    /// keeps distance order.
    pub keyword_weight: f32,
    /// Keep only the best candidate per normalized summary
    pub deduplicate: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: None,
            vector_weight: 1.0,
            keyword_weight: 0.0,
            deduplicate: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            base_dir: Self::config_dir().unwrap_or_else(|_| PathBuf::from(".convo-index")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 2 and 8192)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid embedding timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid index directory: {0:?} (must be a non-empty relative path)")]
    InvalidIndexDirectory(String),
    #[error("Invalid minimum search k: {0} (must be between 1 and 10000)")]
    InvalidMinSearchK(usize),
    #[error("Invalid batch concurrency: {0} (must be between 1 and 64)")]
    InvalidBatchConcurrency(usize),
    #[error("Invalid write retry count: {0} (must be between 1 and 10)")]
    InvalidWriteRetries(u32),
    #[error("Invalid summary length: {0} (must be between 1 and 10000 characters)")]
    InvalidSummaryLength(usize),
    #[error("Invalid index cache size: {0} (must be between 1 and 100000)")]
    InvalidCacheSize(usize),
    #[error("Invalid similarity threshold: {0} (must be a non-negative number)")]
    InvalidSimilarityThreshold(f32),
    #[error("Invalid ranking weights: vector {vector}, keyword {keyword} (must be non-negative, not both zero)")]
    InvalidRankingWeights { vector: f32, keyword: f32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Default base directory, `$CONVO_INDEX_HOME` or `~/.convo-index`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Some(home) = env::var_os(HOME_ENV_VAR).filter(|value| !value.is_empty()) {
            return Ok(PathBuf::from(home));
        }

        dirs::home_dir()
            .map(|home| home.join(".convo-index"))
            .or_else(|| dirs::data_dir().map(|data| data.join("convo-index")))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load from the default base directory
    #[inline]
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir().context("Failed to determine config directory")?;
        Self::load(config_dir)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                ollama: OllamaConfig::default(),
                index: IndexConfig::default(),
                search: SearchConfig::default(),
                base_dir: config_dir.as_ref().to_path_buf(),
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.index.validate()?;
        self.search.validate()?;
        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite database
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("metadata.db")
    }

    /// Directory holding the per-group index artifacts
    #[inline]
    pub fn index_dir_path(&self) -> PathBuf {
        self.get_base_dir().join(&self.index.directory)
    }

    #[inline]
    pub fn embedding_dimension(&self) -> usize {
        self.ollama.embedding_dimension as usize
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(2..=8192).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    pub fn set_embedding_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(2..=8192).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.embedding_dimension = dimension;
        Ok(())
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let directory = self.directory.trim();
        if directory.is_empty() || Path::new(directory).is_absolute() {
            return Err(ConfigError::InvalidIndexDirectory(self.directory.clone()));
        }

        if !(1..=10_000).contains(&self.min_search_k) {
            return Err(ConfigError::InvalidMinSearchK(self.min_search_k));
        }

        if !(1..=64).contains(&self.batch_concurrency) {
            return Err(ConfigError::InvalidBatchConcurrency(self.batch_concurrency));
        }

        if !(1..=10).contains(&self.max_write_retries) {
            return Err(ConfigError::InvalidWriteRetries(self.max_write_retries));
        }

        if !(1..=10_000).contains(&self.summary_max_chars) {
            return Err(ConfigError::InvalidSummaryLength(self.summary_max_chars));
        }

        if !(1..=100_000).contains(&self.max_cached_indexes) {
            return Err(ConfigError::InvalidCacheSize(self.max_cached_indexes));
        }

        Ok(())
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(threshold) = self.similarity_threshold {
            if !(threshold.is_finite() && threshold >= 0.0) {
                return Err(ConfigError::InvalidSimilarityThreshold(threshold));
            }
        }

        let weight_ok = |weight: f32| weight.is_finite() && weight >= 0.0;
        if !weight_ok(self.vector_weight)
            || !weight_ok(self.keyword_weight)
            || self.vector_weight + self.keyword_weight <= 0.0
        {
            return Err(ConfigError::InvalidRankingWeights {
                vector: self.vector_weight,
                keyword: self.keyword_weight,
            });
        }

        Ok(())
    }

    /// Whether keyword overlap contributes to the ranking
    pub fn hybrid_ranking(&self) -> bool {
        self.keyword_weight > 0.0
    }
}
