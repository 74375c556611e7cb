// Search module
// Ranked, paginated nearest-neighbor queries resolved back to messages

mod ranking;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, SearchConfig};
use crate::database::sqlite::{
    Message, MessageQueries, SegmentQueries, VectorIndexEntry, VectorIndexEntryQueries,
    VectorType,
};
use crate::embeddings::{EmbeddingProvider, check_dimension};
use crate::index::{IndexEngine, IndexKey};
use crate::{Result, VectorError};
use ranking::{Candidate, rerank};

const DEFAULT_TAKE: usize = 10;

fn default_take() -> usize {
    DEFAULT_TAKE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub group_id: i64,
    pub query: String,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_take")]
    pub take: usize,
    #[serde(default)]
    pub vector_type: VectorType,
}

impl SearchRequest {
    #[inline]
    pub fn new(group_id: i64, query: impl Into<String>) -> Self {
        Self {
            group_id,
            query: query.into(),
            skip: 0,
            take: DEFAULT_TAKE,
            vector_type: VectorType::ConversationSegment,
        }
    }

    #[inline]
    pub fn page(mut self, skip: usize, take: usize) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }

    #[inline]
    pub fn vector_type(mut self, vector_type: VectorType) -> Self {
        self.vector_type = vector_type;
        self
    }
}

/// One ranked entity with the messages it stands for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entity_id: i64,
    pub distance: f32,
    /// Weighted vector and keyword score the hits are ordered by, highest
    /// first
    pub relevance: f32,
    pub summary: String,
    /// In conversation order
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub group_id: i64,
    pub skip: usize,
    pub take: usize,
    /// Candidates left after the distance cutoff and deduplication, before
    /// paging
    pub count: usize,
    pub hits: Vec<SearchHit>,
}

impl SearchResponse {
    #[inline]
    pub fn empty(request: &SearchRequest) -> Self {
        Self {
            group_id: request.group_id,
            skip: request.skip,
            take: request.take,
            count: 0,
            hits: Vec::new(),
        }
    }

    /// Messages of every hit on the page, hit by hit
    #[inline]
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.hits.iter().flat_map(|hit| hit.messages.iter())
    }
}

/// Answers queries against a group's index. Holds only read locks on the
/// index; concurrent searches never block each other.
pub struct SearchEngine {
    provider: Arc<dyn EmbeddingProvider>,
    engine: Arc<IndexEngine>,
    min_search_k: usize,
    embed_timeout: Duration,
    ranking: SearchConfig,
}

impl SearchEngine {
    #[inline]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        engine: Arc<IndexEngine>,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            engine,
            min_search_k: config.index.min_search_k,
            embed_timeout: config.ollama.timeout(),
            ranking: config.search.clone(),
        }
    }

    /// Runs one query.
    ///
    /// A group without a valid index, or whose artifact cannot be loaded,
    /// yields an empty page with a count of zero. Embedding the query is the
    /// only step whose failure fails the request.
    #[inline]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let key = IndexKey::new(request.group_id, request.vector_type);

        if !self.engine.has_valid_index(key).await? {
            debug!("{}: no valid index, empty result", key);
            return Ok(SearchResponse::empty(request));
        }

        let query = self.embed_query(key, &request.query).await?;

        let k = request
            .skip
            .saturating_add(request.take)
            .max(self.min_search_k);

        let neighbors = match self.engine.search(key, &query, k).await {
            Ok(neighbors) => neighbors,
            Err(e @ (VectorError::IndexInvalid { .. } | VectorError::IndexMissing { .. })) => {
                warn!("{}: search fell back to an empty result: {}", key, e);
                return Ok(SearchResponse::empty(request));
            }
            Err(e) => return Err(e),
        };

        let positions: Vec<i64> = neighbors.iter().map(|n| n.position as i64).collect();
        let mut entries: HashMap<i64, VectorIndexEntry> = VectorIndexEntryQueries::get_by_positions(
            self.engine.database().pool(),
            key.group_id,
            key.index_type,
            &positions,
        )
        .await?
        .into_iter()
        .map(|entry| (entry.faiss_index, entry))
        .collect();

        // Rank order, dropping positions without an entry
        let candidates: Vec<Candidate> = neighbors
            .iter()
            .filter_map(|neighbor| {
                let entry = entries.remove(&(neighbor.position as i64));
                if entry.is_none() {
                    warn!("{}: position {} has no entry", key, neighbor.position);
                }
                entry.map(|entry| Candidate::new(entry, neighbor.distance))
            })
            .collect();
        let resolved = candidates.len();
        let ranked = rerank(&self.ranking, &request.query, candidates);
        if ranked.len() < resolved {
            debug!(
                "{}: {} of {} candidates dropped by threshold or deduplication",
                key,
                resolved - ranked.len(),
                resolved
            );
        }

        let count = ranked.len();
        let mut hits = Vec::with_capacity(request.take.min(count));
        for candidate in ranked.into_iter().skip(request.skip).take(request.take) {
            let messages = self.resolve_messages(key, candidate.entry.entity_id).await?;
            hits.push(SearchHit {
                entity_id: candidate.entry.entity_id,
                distance: candidate.distance,
                relevance: candidate.relevance,
                summary: candidate.entry.content_summary,
                messages,
            });
        }

        info!(
            "{}: {} candidates, returning {} from offset {}",
            key,
            count,
            hits.len(),
            request.skip
        );

        Ok(SearchResponse {
            group_id: request.group_id,
            skip: request.skip,
            take: request.take,
            count,
            hits,
        })
    }

    async fn embed_query(&self, key: IndexKey, text: &str) -> Result<Vec<f32>> {
        let embedding = tokio::time::timeout(self.embed_timeout, self.provider.embed(text))
            .await
            .unwrap_or_else(|_| {
                Err(VectorError::EmbeddingTimeout {
                    seconds: self.embed_timeout.as_secs(),
                })
            })
            .inspect_err(|e| warn!("{}: failed to embed query: {}", key, e))?;

        check_dimension(self.engine.dimension(), &embedding)?;
        Ok(embedding)
    }

    async fn resolve_messages(&self, key: IndexKey, entity_id: i64) -> Result<Vec<Message>> {
        let pool = self.engine.database().pool();
        let messages = match key.index_type {
            VectorType::ConversationSegment => SegmentQueries::get_messages(pool, entity_id).await?,
            VectorType::Message => MessageQueries::get_by_id(pool, entity_id)
                .await?
                .into_iter()
                .collect(),
        };
        Ok(messages)
    }
}
