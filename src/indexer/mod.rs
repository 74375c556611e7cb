// Indexer module
// Turns source entities into vectors and keeps the per-group indexes current

pub mod consistency;
pub mod content;


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::sqlite::{
    ConversationSegment, Message, MessageQueries, NewVectorIndexEntry, SegmentQueries,
    VectorIndexEntryQueries, VectorType,
};
use crate::embeddings::{EmbeddingProvider, check_dimension};
use crate::index::FlatIndex;
use crate::index::engine::{AppendOutcome, IndexEngine, IndexKey};
use crate::{Result, VectorError};

pub use consistency::{
    CleanupReport, ConsistencyReport, ConsistencyValidator, KeyConsistencyIssue,
};
pub use content::{VectorDocument, build_segment_content, truncate_chars};

/// The provider's own HTTP timeout applies per attempt; the pipeline bound
/// leaves room for its retries.
const EMBED_TIMEOUT_FACTOR: u32 = 3;

/// Result of vectorizing a single entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorizeOutcome {
    Vectorized { position: usize },
    /// The entity already had a vector for its key
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub entity_id: i64,
    pub reason: String,
}

/// Aggregated per-entity outcomes of a batch or rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<EntityFailure>,
    pub cancelled: usize,
    /// Appended to their key's working copy but not persisted because the
    /// key's flush failed. The next successful flush of the key indexes
    /// them; vectorizing them again is a no-op.
    pub flush_pending: Vec<i64>,
}

impl BatchReport {
    #[inline]
    pub fn total(&self) -> usize {
        self.succeeded
            + self.skipped
            + self.failed.len()
            + self.cancelled
            + self.flush_pending.len()
    }

    /// Share of entities that ended up indexed, skipped ones included
    #[inline]
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            1.0
        } else {
            (self.succeeded + self.skipped) as f64 / total as f64
        }
    }

    fn fail(&mut self, entity_id: i64, error: &VectorError) {
        self.failed.push(EntityFailure {
            entity_id,
            reason: error.to_string(),
        });
    }
}

/// Embeds source entities and appends them to their group's index.
///
/// Embedding runs outside the index locks; only the append and the persist
/// serialize per `(group, type)` key.
pub struct Vectorizer {
    provider: Arc<dyn EmbeddingProvider>,
    engine: Arc<IndexEngine>,
    embed_timeout: Duration,
    batch_concurrency: usize,
    summary_max_chars: usize,
}

impl Vectorizer {
    #[inline]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        engine: Arc<IndexEngine>,
        config: &Config,
    ) -> Self {
        if provider.dimension() != engine.dimension() {
            warn!(
                "Embedding provider returns {} dimensions but indexes expect {}",
                provider.dimension(),
                engine.dimension()
            );
        }

        Self {
            provider,
            engine,
            embed_timeout: config.ollama.timeout() * EMBED_TIMEOUT_FACTOR,
            batch_concurrency: config.index.batch_concurrency.max(1),
            summary_max_chars: config.index.summary_max_chars,
        }
    }

    #[inline]
    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    #[inline]
    pub fn engine(&self) -> &Arc<IndexEngine> {
        &self.engine
    }

    #[inline]
    pub fn segment_document(&self, segment: &ConversationSegment) -> VectorDocument {
        VectorDocument::from_segment(segment, self.summary_max_chars)
    }

    #[inline]
    pub fn message_document(&self, message: &Message) -> VectorDocument {
        VectorDocument::from_message(message, self.summary_max_chars)
    }

    /// Vectorizes one entity and persists its key before returning, so the
    /// source is flagged vectorized on success.
    #[inline]
    pub async fn vectorize_entity(
        &self,
        document: &VectorDocument,
        cancel: &CancellationToken,
    ) -> Result<VectorizeOutcome> {
        let key = IndexKey::new(document.group_id, document.vector_type);
        let outcome = self.append_document(document, cancel).await?;

        if let VectorizeOutcome::Vectorized { .. } = outcome {
            self.engine.flush_key(key).await.inspect_err(|e| {
                error!(
                    "{}: entity {} appended but not persisted: {}",
                    key, document.entity_id, e
                );
            })?;
        }

        Ok(outcome)
    }

    #[inline]
    pub async fn vectorize_segment(
        &self,
        segment: &ConversationSegment,
        cancel: &CancellationToken,
    ) -> Result<VectorizeOutcome> {
        self.vectorize_entity(&self.segment_document(segment), cancel)
            .await
    }

    /// Vectorizes a stored segment by id. A missing segment is not an error.
    #[inline]
    pub async fn vectorize_segment_by_id(
        &self,
        segment_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<VectorizeOutcome>> {
        let Some(segment) =
            SegmentQueries::get_by_id(self.engine.database().pool(), segment_id).await?
        else {
            info!("Segment {} not found, nothing to vectorize", segment_id);
            return Ok(None);
        };

        self.vectorize_segment(&segment, cancel).await.map(Some)
    }

    /// Vectorizes many entities with bounded concurrency. Failures are
    /// recorded per entity; every touched key is persisted once at the end,
    /// cancelled or not.
    #[inline]
    pub async fn vectorize_batch(
        &self,
        documents: &[VectorDocument],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let outcomes: Vec<(IndexKey, i64, Result<VectorizeOutcome>)> = stream::iter(documents)
            .map(|document| async move {
                let key = IndexKey::new(document.group_id, document.vector_type);
                let outcome = self.append_document(document, cancel).await;
                (key, document.entity_id, outcome)
            })
            .buffer_unordered(self.batch_concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        let mut appended: HashMap<IndexKey, Vec<i64>> = HashMap::new();

        for (key, entity_id, outcome) in outcomes {
            match outcome {
                Ok(VectorizeOutcome::Vectorized { .. }) => {
                    appended.entry(key).or_default().push(entity_id);
                }
                Ok(VectorizeOutcome::Skipped) => report.skipped += 1,
                Err(VectorError::Cancelled) => report.cancelled += 1,
                Err(e) => report.fail(entity_id, &e),
            }
        }

        for (key, entity_ids) in appended {
            match self.engine.flush_key(key).await {
                Ok(_) => report.succeeded += entity_ids.len(),
                Err(e) => {
                    error!(
                        "{}: batch persist failed, {} entities wait for the next flush: {}",
                        key,
                        entity_ids.len(),
                        e
                    );
                    report.flush_pending.extend(entity_ids);
                }
            }
        }

        report.failed.sort_by_key(|failure| failure.entity_id);
        report.flush_pending.sort_unstable();

        info!(
            "Batch of {}: {} vectorized, {} skipped, {} failed, {} cancelled, {} awaiting flush",
            documents.len(),
            report.succeeded,
            report.skipped,
            report.failed.len(),
            report.cancelled,
            report.flush_pending.len()
        );
        Ok(report)
    }

    #[inline]
    pub async fn vectorize_segments(
        &self,
        segments: &[ConversationSegment],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let documents: Vec<VectorDocument> = segments
            .iter()
            .map(|segment| self.segment_document(segment))
            .collect();
        self.vectorize_batch(&documents, cancel).await
    }

    /// Vectorizes everything in the group that has no vector yet, oldest
    /// first.
    #[inline]
    pub async fn vectorize_group(
        &self,
        group_id: i64,
        vector_type: VectorType,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let documents = self.pending_documents(group_id, vector_type).await?;
        if documents.is_empty() {
            debug!("Group {} has nothing to vectorize ({})", group_id, vector_type);
            return Ok(BatchReport::default());
        }

        info!(
            "Vectorizing {} pending {} entities in group {}",
            documents.len(),
            vector_type,
            group_id
        );
        self.vectorize_batch(&documents, cancel).await
    }

    /// Persists every key with unpersisted appends
    #[inline]
    pub async fn flush(&self) -> Result<usize> {
        self.engine.flush_all().await
    }

    /// Re-embeds every source entity of the key into a new artifact
    /// generation and swaps it in atomically. Entities that fail to embed
    /// stay unvectorized. A cancelled rebuild leaves the current generation
    /// in place.
    #[inline]
    pub async fn rebuild_group(
        &self,
        group_id: i64,
        vector_type: VectorType,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let key = IndexKey::new(group_id, vector_type);
        let documents = self.all_documents(group_id, vector_type).await?;
        info!("Rebuilding {} from {} source entities", key, documents.len());

        // Ordered so positions follow source order
        let embedded: Vec<Result<Vec<f32>>> = stream::iter(&documents)
            .map(|document| self.embed(document, cancel))
            .buffered(self.batch_concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            warn!("{}: rebuild cancelled, keeping the current generation", key);
            return Err(VectorError::Cancelled);
        }

        let mut report = BatchReport::default();
        let mut index = FlatIndex::new(self.engine.dimension(), self.engine.metric());
        let mut entries = Vec::with_capacity(documents.len());

        for (document, embedding) in documents.iter().zip(embedded) {
            let position = embedding.and_then(|vector| index.append(&vector));
            match position {
                Ok(position) => {
                    entries.push(NewVectorIndexEntry {
                        group_id,
                        vector_type,
                        entity_id: document.entity_id,
                        faiss_index: position as i64,
                        content_summary: document.summary.clone(),
                    });
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(
                        "{}: entity {} left out of rebuild: {}",
                        key, document.entity_id, e
                    );
                    report.fail(document.entity_id, &e);
                }
            }
        }

        self.engine.install_generation(key, index, entries).await?;

        info!(
            "Rebuilt {}: {} vectors, {} failed",
            key,
            report.succeeded,
            report.failed.len()
        );
        Ok(report)
    }

    /// Embeds and appends without persisting
    async fn append_document(
        &self,
        document: &VectorDocument,
        cancel: &CancellationToken,
    ) -> Result<VectorizeOutcome> {
        let key = IndexKey::new(document.group_id, document.vector_type);

        if cancel.is_cancelled() {
            return Err(VectorError::Cancelled);
        }

        // Cheap pre-check so known entities never reach the provider
        let known = VectorIndexEntryQueries::exists(
            self.engine.database().pool(),
            key.group_id,
            key.index_type,
            document.entity_id,
        )
        .await?;
        if known {
            debug!("{}: entity {} already vectorized", key, document.entity_id);
            return Ok(VectorizeOutcome::Skipped);
        }

        let vector = self.embed(document, cancel).await.inspect_err(|e| {
            if !matches!(e, VectorError::Cancelled) {
                warn!(
                    "{}: failed to embed entity {}: {}",
                    key, document.entity_id, e
                );
            }
        })?;

        let outcome = self
            .engine
            .append_entry(key, document.entity_id, &vector, &document.summary)
            .await
            .inspect_err(|e| {
                error!(
                    "{}: failed to append entity {}: {}",
                    key, document.entity_id, e
                );
            })?;

        Ok(match outcome {
            AppendOutcome::Appended { position } => VectorizeOutcome::Vectorized { position },
            AppendOutcome::AlreadyPresent => VectorizeOutcome::Skipped,
        })
    }

    async fn embed(
        &self,
        document: &VectorDocument,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        if cancel.is_cancelled() {
            return Err(VectorError::Cancelled);
        }

        let embedding = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(VectorError::Cancelled),
            result = tokio::time::timeout(self.embed_timeout, self.provider.embed(&document.content)) => {
                result.map_err(|_| VectorError::EmbeddingTimeout {
                    seconds: self.embed_timeout.as_secs(),
                })??
            }
        };

        check_dimension(self.engine.dimension(), &embedding)?;
        Ok(embedding)
    }

    async fn pending_documents(
        &self,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<Vec<VectorDocument>> {
        let pool = self.engine.database().pool();
        Ok(match vector_type {
            VectorType::ConversationSegment => SegmentQueries::list_unvectorized(pool, group_id)
                .await?
                .iter()
                .map(|segment| self.segment_document(segment))
                .collect(),
            VectorType::Message => MessageQueries::list_unvectorized(pool, group_id)
                .await?
                .iter()
                .map(|message| self.message_document(message))
                .collect(),
        })
    }

    async fn all_documents(
        &self,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<Vec<VectorDocument>> {
        let pool = self.engine.database().pool();
        Ok(match vector_type {
            VectorType::ConversationSegment => SegmentQueries::list_by_group(pool, group_id)
                .await?
                .iter()
                .map(|segment| self.segment_document(segment))
                .collect(),
            VectorType::Message => MessageQueries::list_by_group(pool, group_id)
                .await?
                .iter()
                .map(|message| self.message_document(message))
                .collect(),
        })
    }
}
