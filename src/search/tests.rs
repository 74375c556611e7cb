use super::*;
use crate::database::sqlite::{ConversationSegment, Database, NewConversationSegment, NewMessage};
use crate::indexer::Vectorizer;
use crate::index::storage;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const KEYWORDS: [&str; 4] = ["rust", "coffee", "music", "python"];

/// Counts keyword occurrences, one axis per keyword. Fails on `unembeddable`.
#[derive(Default)]
struct KeywordProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for KeywordProvider {
    fn dimension(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("unembeddable") {
            return Err(VectorError::EmbeddingFailed("provider down".to_string()));
        }
        Ok(KEYWORDS
            .iter()
            .map(|keyword| text.matches(keyword).count() as f32)
            .collect())
    }
}

struct Fixture {
    _temp_dir: TempDir,
    provider: Arc<KeywordProvider>,
    vectorizer: Vectorizer,
    search: SearchEngine,
}

async fn fixture() -> Fixture {
    fixture_with(SearchConfig::default()).await
}

async fn fixture_with(search: SearchConfig) -> Fixture {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        search,
        ..Config::default()
    };
    config.ollama.embedding_dimension = KEYWORDS.len() as u32;

    let database = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("Failed to create database");
    let engine = Arc::new(IndexEngine::new(database, &config));
    let provider = Arc::new(KeywordProvider::default());
    let dyn_provider: Arc<dyn EmbeddingProvider> = Arc::clone(&provider) as _;

    Fixture {
        _temp_dir: temp_dir,
        vectorizer: Vectorizer::new(Arc::clone(&dyn_provider), Arc::clone(&engine), &config),
        search: SearchEngine::new(dyn_provider, engine, &config),
        provider,
    }
}

fn at(minute: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 7, 1)
        .and_then(|d| d.and_hms_opt(18, 0, 0))
        .expect("valid timestamp")
        + ChronoDuration::minutes(minute)
}

async fn indexed_segment(fixture: &Fixture, group_id: i64, lines: &[&str]) -> ConversationSegment {
    let messages: Vec<NewMessage> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| NewMessage {
            message_id: (uuid::Uuid::new_v4().as_u128() % 1_000_000_000) as i64,
            from_user_id: i as i64 % 2,
            content: (*line).to_string(),
            date_time: at(i as i64),
        })
        .collect();

    let segment = fixture
        .vectorizer
        .engine()
        .database()
        .insert_segment(&NewConversationSegment {
            group_id,
            start_time: at(0),
            end_time: at(lines.len() as i64),
            content_summary: String::new(),
            topic_keywords: vec![],
            full_content: String::new(),
            messages,
        })
        .await
        .expect("Failed to create segment");

    fixture
        .vectorizer
        .vectorize_segment(&segment, &CancellationToken::new())
        .await
        .expect("vectorize");
    segment
}

#[tokio::test]
async fn never_vectorized_group_is_empty_without_embedding() {
    let fixture = fixture().await;

    let response = fixture
        .search
        .search(&SearchRequest::new(404, "rust"))
        .await
        .expect("search");

    assert_eq!(response.count, 0);
    assert!(response.hits.is_empty());
    assert_eq!(response.group_id, 404);
    assert_eq!(fixture.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn nearest_segment_ranks_first_with_messages_in_order() {
    let fixture = fixture().await;
    indexed_segment(&fixture, 1, &["coffee break?", "sure, coffee"]).await;
    let rust = indexed_segment(
        &fixture,
        1,
        &["the rust build fails", "which rust version", "latest stable"],
    )
    .await;
    indexed_segment(&fixture, 1, &["new music tonight"]).await;

    let response = fixture
        .search
        .search(&SearchRequest::new(1, "rust"))
        .await
        .expect("search");

    assert_eq!(response.count, 3);
    let top = response.hits.first().expect("a hit");
    assert_eq!(top.entity_id, rust.id);

    let texts: Vec<&str> = top.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        texts,
        vec!["the rust build fails", "which rust version", "latest stable"]
    );
    assert!(response.hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[tokio::test]
async fn pages_follow_rank_order() {
    let fixture = fixture().await;
    let mut segments = Vec::new();
    for repeat in 1..=5 {
        let line = vec!["rust"; repeat].join(" ");
        segments.push(indexed_segment(&fixture, 2, &[line.as_str()]).await);
    }

    let full = fixture
        .search
        .search(&SearchRequest::new(2, "rust").page(0, 5))
        .await
        .expect("search");
    let ranked: Vec<i64> = full.hits.iter().map(|h| h.entity_id).collect();
    let expected: Vec<i64> = segments.iter().map(|s| s.id).collect();
    assert_eq!(ranked, expected);

    let page = fixture
        .search
        .search(&SearchRequest::new(2, "rust").page(2, 2))
        .await
        .expect("search");
    assert_eq!(page.count, 5);
    let paged: Vec<i64> = page.hits.iter().map(|h| h.entity_id).collect();
    assert_eq!(paged, ranked[2..4].to_vec());

    let beyond = fixture
        .search
        .search(&SearchRequest::new(2, "rust").page(10, 5))
        .await
        .expect("search");
    assert_eq!(beyond.count, 5);
    assert!(beyond.hits.is_empty());
}

#[tokio::test]
async fn query_embedding_failure_is_an_error() {
    let fixture = fixture().await;
    indexed_segment(&fixture, 3, &["rust"]).await;

    let result = fixture
        .search
        .search(&SearchRequest::new(3, "unembeddable"))
        .await;

    assert!(matches!(result, Err(ref e) if e.is_embedding_failure()));
}

#[tokio::test]
async fn unreadable_artifact_reads_as_empty() {
    let fixture = fixture().await;
    indexed_segment(&fixture, 4, &["rust"]).await;

    let engine = fixture.vectorizer.engine();
    let key = IndexKey::new(4, VectorType::ConversationSegment);
    engine.evict(key).await.expect("evict");
    tokio::fs::write(
        engine
            .index_dir()
            .join(storage::file_name(4, VectorType::ConversationSegment)),
        b"garbage",
    )
    .await
    .expect("corrupt");

    let response = fixture
        .search
        .search(&SearchRequest::new(4, "rust"))
        .await
        .expect("search");

    assert_eq!(response.count, 0);
    assert!(response.hits.is_empty());
}

#[tokio::test]
async fn message_vectors_resolve_to_their_message() {
    let fixture = fixture().await;
    indexed_segment(&fixture, 5, &["python or rust", "music please"]).await;
    fixture
        .vectorizer
        .vectorize_group(5, VectorType::Message, &CancellationToken::new())
        .await
        .expect("vectorize messages");

    let response = fixture
        .search
        .search(
            &SearchRequest::new(5, "music")
                .page(0, 1)
                .vector_type(VectorType::Message),
        )
        .await
        .expect("search");

    assert_eq!(response.count, 2);
    let messages: Vec<&str> = response.messages().map(|m| m.content.as_str()).collect();
    assert_eq!(messages, vec!["music please"]);
}

async fn indexed_messages(fixture: &Fixture, group_id: i64, lines: &[&str]) {
    indexed_segment(fixture, group_id, lines).await;
    fixture
        .vectorizer
        .vectorize_group(group_id, VectorType::Message, &CancellationToken::new())
        .await
        .expect("vectorize messages");
}

fn message_search(group_id: i64, query: &str) -> SearchRequest {
    SearchRequest::new(group_id, query).vector_type(VectorType::Message)
}

#[tokio::test]
async fn similarity_threshold_bounds_the_count() {
    let fixture = fixture_with(SearchConfig {
        similarity_threshold: Some(1.0),
        ..SearchConfig::default()
    })
    .await;
    indexed_messages(&fixture, 6, &["rust", "rust coffee", "music music"]).await;

    let response = fixture
        .search
        .search(&message_search(6, "rust"))
        .await
        .expect("search");

    // Distances 0, 1 and 5: the last one is past the cutoff
    assert_eq!(response.count, 2);
    let texts: Vec<&str> = response.messages().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["rust", "rust coffee"]);
}

#[tokio::test]
async fn keyword_weight_reorders_hits() {
    let fixture = fixture_with(SearchConfig {
        vector_weight: 0.5,
        keyword_weight: 0.5,
        ..SearchConfig::default()
    })
    .await;
    indexed_messages(&fixture, 7, &["coffee", "pour the coffee, rust"]).await;

    // "coffee" is the nearer vector, the other message holds the query
    // literally
    let response = fixture
        .search
        .search(&message_search(7, "pour the coffee"))
        .await
        .expect("search");

    assert_eq!(response.count, 2);
    let first = response.hits.first().expect("a hit");
    assert_eq!(first.summary, "pour the coffee, rust");
    assert!(first.distance > 0.5);
    assert!(response.hits.windows(2).all(|w| w[0].relevance >= w[1].relevance));
}

#[tokio::test]
async fn duplicate_summaries_collapse_to_the_nearest() {
    let fixture = fixture_with(SearchConfig {
        deduplicate: true,
        ..SearchConfig::default()
    })
    .await;
    indexed_messages(&fixture, 8, &["Rust  music", "rust music", "coffee"]).await;

    let response = fixture
        .search
        .search(&message_search(8, "rust music"))
        .await
        .expect("search");

    assert_eq!(response.count, 2);
    let texts: Vec<&str> = response.messages().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["rust music", "coffee"]);
}

#[test]
fn request_defaults_from_json() {
    let request: SearchRequest =
        serde_json::from_str(r#"{"group_id": 9, "query": "deploy"}"#).expect("parse");

    assert_eq!(request.skip, 0);
    assert_eq!(request.take, 10);
    assert_eq!(request.vector_type, VectorType::ConversationSegment);
}
