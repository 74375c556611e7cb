// Service module
// Composition root wiring the store, provider, engine, pipeline and search


use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::sqlite::{
    ConversationSegment, Database, IndexFile, IndexFileQueries, NewConversationSegment,
    SegmentQueries, VectorIndexEntryQueries, VectorStatistics, VectorType,
};
use crate::embeddings::{EmbeddingProvider, OllamaClient};
use crate::index::IndexEngine;
use crate::index::storage::FILE_EXTENSION;
use crate::indexer::{
    CleanupReport, ConsistencyReport, ConsistencyValidator, VectorizeOutcome, Vectorizer,
};
use crate::search::{SearchEngine, SearchRequest, SearchResponse};
use crate::{Result, VectorError};

const TOP_GROUPS: i64 = 10;

/// Outcome of each health probe; `None` means the probe passed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub embedding_error: Option<String>,
    pub database_error: Option<String>,
    pub index_dir_error: Option<String>,
}

impl HealthReport {
    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.embedding_error.is_none()
            && self.database_error.is_none()
            && self.index_dir_error.is_none()
    }
}

/// Overview of the artifacts the registry knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatus {
    pub index_dir: PathBuf,
    pub valid_files: Vec<IndexFile>,
    pub total_vectors: i64,
    pub total_bytes: i64,
    /// Artifact files present in the index directory, referenced or not
    pub artifacts_on_disk: usize,
}

impl IndexStatus {
    #[inline]
    pub fn files_of_type(&self, index_type: VectorType) -> usize {
        self.valid_files
            .iter()
            .filter(|file| file.index_type == index_type)
            .count()
    }
}

/// Owns every component built from one [`Config`]
pub struct VectorService {
    config: Config,
    database: Database,
    provider: Arc<dyn EmbeddingProvider>,
    engine: Arc<IndexEngine>,
    vectorizer: Vectorizer,
    search: SearchEngine,
}

impl VectorService {
    /// Builds the service with the Ollama embedding provider
    #[inline]
    pub async fn new(config: Config) -> Result<Self> {
        let client = OllamaClient::new(&config.ollama)
            .context("Failed to initialize Ollama client")?;
        Self::with_provider(config, Arc::new(client)).await
    }

    #[inline]
    pub async fn with_provider(
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| VectorError::Config(e.to_string()))?;

        let database = Database::initialize_from_config_dir(config.get_base_dir())
            .await
            .context("Failed to initialize metadata store")?;
        let engine = Arc::new(IndexEngine::new(database.clone(), &config));

        let vectorizer = Vectorizer::new(Arc::clone(&provider), Arc::clone(&engine), &config);
        let search = SearchEngine::new(Arc::clone(&provider), Arc::clone(&engine), &config);

        info!(
            "Vector service ready (dimension {}, metric {}, index dir {})",
            engine.dimension(),
            engine.metric(),
            engine.index_dir().display()
        );

        Ok(Self {
            config,
            database,
            provider,
            engine,
            vectorizer,
            search,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub fn engine(&self) -> &Arc<IndexEngine> {
        &self.engine
    }

    #[inline]
    pub fn vectorizer(&self) -> &Vectorizer {
        &self.vectorizer
    }

    /// Stores a segment handed in by the upstream segmenter
    #[inline]
    pub async fn ingest(&self, segment: &NewConversationSegment) -> Result<ConversationSegment> {
        let stored = self.database.insert_segment(segment).await?;
        info!(
            "Ingested segment {} for group {} ({} messages)",
            stored.id, stored.group_id, stored.message_count
        );
        Ok(stored)
    }

    /// Stores a segment and vectorizes it right away
    #[inline]
    pub async fn ingest_and_vectorize(
        &self,
        segment: &NewConversationSegment,
        cancel: &CancellationToken,
    ) -> Result<(ConversationSegment, VectorizeOutcome)> {
        let stored = self.ingest(segment).await?;
        let outcome = self.vectorizer.vectorize_segment(&stored, cancel).await?;
        Ok((stored, outcome))
    }

    #[inline]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.search.search(request).await
    }

    /// Embedding provider answers with the configured dimension, metadata
    /// store answers `SELECT 1` and the index directory exists.
    #[inline]
    pub async fn health(&self) -> HealthReport {
        let mut report = HealthReport::default();

        if let Err(e) = self.provider.probe().await {
            warn!("Health check: embedding provider unhealthy: {}", e);
            report.embedding_error = Some(e.to_string());
        }

        if let Err(e) = self.database.ping().await {
            warn!("Health check: metadata store unreachable: {:#}", e);
            report.database_error = Some(format!("{e:#}"));
        }

        if let Err(e) = tokio::fs::create_dir_all(self.engine.index_dir()).await {
            warn!(
                "Health check: cannot create index directory {}: {}",
                self.engine.index_dir().display(),
                e
            );
            report.index_dir_error = Some(e.to_string());
        }

        report
    }

    #[inline]
    pub async fn is_healthy(&self) -> bool {
        self.health().await.is_healthy()
    }

    #[inline]
    pub async fn status(&self) -> Result<IndexStatus> {
        let valid_files = IndexFileQueries::list_valid(self.database.pool()).await?;
        let total_vectors = valid_files.iter().map(|f| f.vector_count).sum();
        let total_bytes = valid_files.iter().map(|f| f.file_size).sum();

        let index_dir = self.engine.index_dir().to_path_buf();
        let artifacts_on_disk = count_artifacts(&index_dir).await?;

        Ok(IndexStatus {
            index_dir,
            valid_files,
            total_vectors,
            total_bytes,
            artifacts_on_disk,
        })
    }

    #[inline]
    pub async fn statistics(&self) -> Result<VectorStatistics> {
        let pool = self.database.pool();
        let (total_segments, vectorized_segments) = SegmentQueries::count_totals(pool).await?;

        Ok(VectorStatistics {
            total_segments,
            vectorized_segments,
            pending_segments: total_segments - vectorized_segments,
            entries_by_type: VectorIndexEntryQueries::count_by_type(pool).await?,
            top_groups: SegmentQueries::top_groups(pool, TOP_GROUPS).await?,
        })
    }

    #[inline]
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport> {
        let validator = ConsistencyValidator::new(&self.engine);
        Ok(validator.validate_consistency().await?)
    }

    #[inline]
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        // Every artifact must be registered before unreferenced files go
        self.engine.flush_all().await?;
        let validator = ConsistencyValidator::new(&self.engine);
        Ok(validator.cleanup().await?)
    }

    /// Reclaims space in the metadata store
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        Ok(self.database.optimize().await?)
    }

    /// Persists every pending append
    #[inline]
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.engine.flush_all().await?;
        info!("Flushed {} indexes on shutdown", flushed);
        Ok(())
    }
}

async fn count_artifacts(index_dir: &std::path::Path) -> Result<usize> {
    let mut dir = match tokio::fs::read_dir(index_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0;
    while let Some(entry) = dir.next_entry().await? {
        if entry
            .path()
            .extension()
            .is_some_and(|ext| ext == FILE_EXTENSION)
        {
            count += 1;
        }
    }
    Ok(count)
}
