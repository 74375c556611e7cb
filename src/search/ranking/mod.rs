// Post-processing of ranked candidates before paging


use std::collections::HashSet;

use crate::config::SearchConfig;
use crate::database::sqlite::VectorIndexEntry;

/// An index neighbor resolved to its entry
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub entry: VectorIndexEntry,
    pub distance: f32,
    pub relevance: f32,
}

impl Candidate {
    pub fn new(entry: VectorIndexEntry, distance: f32) -> Self {
        Self {
            entry,
            distance,
            relevance: vector_score(distance),
        }
    }
}

/// Maps a distance onto `[0, 1]`, closer is higher. Distances of 2 and more
/// score zero.
pub(crate) fn vector_score(distance: f32) -> f32 {
    (1.0 - distance / 2.0).max(0.0)
}

/// 1.0 when the content holds the whole query, otherwise the share of query
/// words of two or more characters that occur in it. Case-insensitive.
pub(crate) fn keyword_score(content: &str, query: &str) -> f32 {
    let content = content.to_lowercase();
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return 0.0;
    }
    if content.contains(&query) {
        return 1.0;
    }

    let words: Vec<&str> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 2)
        .collect();
    if words.is_empty() {
        return 0.0;
    }

    let matched = words.iter().filter(|word| content.contains(*word)).count();
    matched as f32 / words.len() as f32
}

/// Lowercased summary with all whitespace removed
fn dedup_key(summary: &str) -> String {
    summary
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Applies the distance cutoff, scores relevance, orders by it and drops
/// candidates whose summary repeats a better one. Candidates come in
/// nearest-first order; ties keep that order. Empty summaries are never
/// treated as duplicates.
pub(crate) fn rerank(
    config: &SearchConfig,
    query: &str,
    mut candidates: Vec<Candidate>,
) -> Vec<Candidate> {
    if let Some(threshold) = config.similarity_threshold {
        candidates.retain(|candidate| candidate.distance <= threshold);
    }

    for candidate in &mut candidates {
        let keyword = if config.hybrid_ranking() {
            keyword_score(&candidate.entry.content_summary, query)
        } else {
            0.0
        };
        candidate.relevance =
            vector_score(candidate.distance) * config.vector_weight + keyword * config.keyword_weight;
    }
    candidates.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    if config.deduplicate {
        let mut seen = HashSet::new();
        candidates.retain(|candidate| {
            let key = dedup_key(&candidate.entry.content_summary);
            key.is_empty() || seen.insert(key)
        });
    }

    candidates
}
