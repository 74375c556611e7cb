//! Shared fixtures for the integration tests

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use convo_index::config::Config;
use convo_index::database::sqlite::{NewConversationSegment, NewMessage};
use convo_index::embeddings::EmbeddingProvider;
use convo_index::service::VectorService;
use convo_index::{Result, VectorError};

pub const DIM: usize = 8;

/// Bag-of-words embeddings: every word lands on one axis picked by its
/// bytes. Texts containing `unembeddable` fail.
pub struct HashingProvider {
    pub dimension: usize,
    pub calls: AtomicUsize,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("unembeddable") {
            return Err(VectorError::EmbeddingFailed("model refused input".to_string()));
        }

        let mut vector = vec![0.0; self.dimension];
        for word in text.split_whitespace() {
            let axis = word
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
                % self.dimension;
            if let Some(slot) = vector.get_mut(axis) {
                *slot += 1.0;
            }
        }
        Ok(vector)
    }
}

pub struct TestService {
    pub temp_dir: TempDir,
    pub provider: Arc<HashingProvider>,
    pub service: VectorService,
}

pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.ollama.embedding_dimension = DIM as u32;
    config
}

/// Service over a fresh temp dir whose configured dimension is [`DIM`]
/// while the provider answers with `provider_dimension`.
pub async fn service_with_dimension(provider_dimension: usize) -> TestService {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let provider = Arc::new(HashingProvider::new(provider_dimension));
    let service = VectorService::with_provider(
        test_config(&temp_dir),
        Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
    )
    .await
    .expect("should create service");

    TestService {
        temp_dir,
        provider,
        service,
    }
}

pub async fn service() -> TestService {
    service_with_dimension(DIM).await
}

pub fn at(minute: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 14)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .expect("valid timestamp")
        + Duration::minutes(minute)
}

/// Segment whose messages alternate between two speakers. `first_message_id`
/// keeps message ids unique across segments.
pub fn segment(group_id: i64, first_message_id: i64, lines: &[&str]) -> NewConversationSegment {
    let messages: Vec<NewMessage> = lines
        .iter()
        .zip(0..)
        .map(|(line, i)| NewMessage {
            message_id: first_message_id + i,
            from_user_id: 1000 + i % 2,
            content: (*line).to_string(),
            date_time: at(i),
        })
        .collect();

    NewConversationSegment {
        group_id,
        start_time: at(0),
        end_time: at(lines.len() as i64),
        content_summary: lines.first().map(|l| (*l).to_string()).unwrap_or_default(),
        topic_keywords: vec![],
        full_content: String::new(),
        messages,
    }
}
