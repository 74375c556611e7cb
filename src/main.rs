use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use convo_index::commands::{
    check_consistency, check_health, cleanup, ingest_segments, rebuild_group, search, show_status,
    show_statistics, vectorize_group, vectorize_segment,
};
use convo_index::config::{get_config_dir, show_config};
use convo_index::database::sqlite::VectorType;
use convo_index::search::SearchRequest;

#[derive(Parser)]
#[command(name = "convo-index")]
#[command(about = "Per-group vector indexing and semantic search over conversation segments")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Store conversation segments from a JSON file
    Ingest {
        /// File holding one segment or an array of segments
        file: PathBuf,
        /// Vectorize each segment after storing it
        #[arg(long)]
        vectorize: bool,
    },
    /// Vectorize pending entities of a group, or a single segment
    Vectorize {
        /// Group whose pending entities are vectorized
        #[arg(long, conflicts_with = "segment", required_unless_present = "segment")]
        group: Option<i64>,
        /// Single segment ID to vectorize
        #[arg(long)]
        segment: Option<i64>,
        /// Entity kind: "segment" or "message"
        #[arg(long = "type", default_value = "segment")]
        vector_type: VectorType,
    },
    /// Semantic search within a group
    Search {
        /// Group to search
        #[arg(long)]
        group: i64,
        /// Query text
        query: String,
        /// Number of ranked results to skip
        #[arg(long, default_value_t = 0)]
        skip: usize,
        /// Number of results to return
        #[arg(long, default_value_t = 10)]
        take: usize,
        /// Entity kind: "segment" or "message"
        #[arg(long = "type", default_value = "segment")]
        vector_type: VectorType,
    },
    /// Rebuild a group's index from scratch
    Rebuild {
        /// Group to rebuild
        #[arg(long)]
        group: i64,
        /// Entity kind: "segment" or "message"
        #[arg(long = "type", default_value = "segment")]
        vector_type: VectorType,
    },
    /// Show index files, vector totals and consistency
    Status,
    /// Show vectorization statistics
    Stats,
    /// Check the embedding provider, metadata store and index directory
    Health,
    /// Compare the registry, entries and index files
    Check,
    /// Remove invalid rows, orphaned entries and unreferenced files
    Cleanup {
        /// Also compact the metadata store
        #[arg(long)]
        optimize: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                eprintln!(
                    "Settings live in {}; run with --show to print them",
                    get_config_dir()?.join("config.toml").display()
                );
            }
        }
        Commands::Ingest { file, vectorize } => {
            ingest_segments(&file, vectorize).await?;
        }
        Commands::Vectorize {
            group,
            segment,
            vector_type,
        } => match (segment, group) {
            (Some(segment_id), _) => vectorize_segment(segment_id).await?,
            (None, Some(group_id)) => vectorize_group(group_id, vector_type).await?,
            (None, None) => anyhow::bail!("either --group or --segment is required"),
        },
        Commands::Search {
            group,
            query,
            skip,
            take,
            vector_type,
        } => {
            let request = SearchRequest::new(group, query)
                .page(skip, take)
                .vector_type(vector_type);
            search(request).await?;
        }
        Commands::Rebuild { group, vector_type } => {
            rebuild_group(group, vector_type).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Stats => {
            show_statistics().await?;
        }
        Commands::Health => {
            if !check_health().await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Check => {
            if !check_consistency().await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Cleanup { optimize } => {
            cleanup(optimize).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
