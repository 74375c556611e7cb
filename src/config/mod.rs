// Configuration management module
// TOML settings for the embedding provider and the on-disk indexes

pub mod settings;


use anyhow::{Context, Result};
use console::style;

pub use settings::{
    Config, ConfigError, HOME_ENV_VAR, IndexConfig, OllamaConfig, SearchConfig,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// Print the effective configuration
#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Embedding Provider (Ollama):").bold().yellow());
    eprintln!("  Host: {}", style(&config.ollama.host).cyan());
    eprintln!("  Port: {}", style(config.ollama.port).cyan());
    eprintln!("  Model: {}", style(&config.ollama.model).cyan());
    eprintln!(
        "  Dimension: {}",
        style(config.ollama.embedding_dimension).cyan()
    );
    eprintln!(
        "  Timeout: {}s",
        style(config.ollama.timeout_seconds).cyan()
    );
    match config.ollama_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Index Settings:").bold().yellow());
    eprintln!(
        "  Directory: {}",
        style(config.index_dir_path().display()).cyan()
    );
    eprintln!("  Metric: {}", style(config.index.metric).cyan());
    eprintln!("  Min search k: {}", style(config.index.min_search_k).cyan());
    eprintln!(
        "  Batch concurrency: {}",
        style(config.index.batch_concurrency).cyan()
    );
    eprintln!(
        "  Cached indexes: {}",
        style(config.index.max_cached_indexes).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Search Settings:").bold().yellow());
    match config.search.similarity_threshold {
        Some(threshold) => eprintln!("  Similarity threshold: {}", style(threshold).cyan()),
        None => eprintln!("  Similarity threshold: {}", style("none").dim()),
    }
    eprintln!(
        "  Weights: vector {}, keyword {}",
        style(config.search.vector_weight).cyan(),
        style(config.search.keyword_weight).cyan()
    );
    eprintln!(
        "  Deduplicate: {}",
        style(config.search.deduplicate).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}
