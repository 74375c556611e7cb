use super::*;
use crate::database::sqlite::{NewConversationSegment, NewMessage};
use chrono::NaiveDate;
use tempfile::TempDir;

const DIM: usize = 4;

async fn create_engine() -> (TempDir, Config, IndexEngine) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.ollama.embedding_dimension = DIM as u32;

    let database = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("Failed to create database");
    let engine = IndexEngine::new(database, &config);
    (temp_dir, config, engine)
}

async fn reopen(config: &Config) -> IndexEngine {
    let database = Database::initialize_from_config_dir(config.get_base_dir())
        .await
        .expect("Failed to reopen database");
    IndexEngine::new(database, config)
}

async fn create_segment(engine: &IndexEngine, group_id: i64) -> i64 {
    let at = NaiveDate::from_ymd_opt(2024, 6, 1)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .expect("valid timestamp");
    engine
        .database()
        .insert_segment(&NewConversationSegment {
            group_id,
            start_time: at,
            end_time: at,
            content_summary: String::new(),
            topic_keywords: vec![],
            full_content: "text".to_string(),
            messages: vec![NewMessage {
                message_id: rand_id(),
                from_user_id: 1,
                content: "text".to_string(),
                date_time: at,
            }],
        })
        .await
        .expect("Failed to create segment")
        .id
}

fn rand_id() -> i64 {
    (uuid::Uuid::new_v4().as_u128() % 1_000_000_000) as i64
}

fn unit(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[axis % DIM] = 1.0;
    v
}

async fn is_vectorized(engine: &IndexEngine, segment_id: i64) -> bool {
    engine
        .database()
        .get_segment(segment_id)
        .await
        .expect("Failed to get segment")
        .is_some_and(|s| s.is_vectorized)
}

async fn entry_count(engine: &IndexEngine, key: IndexKey) -> usize {
    VectorIndexEntryQueries::list_for_key(engine.database().pool(), key.group_id, key.index_type)
        .await
        .expect("entries")
        .len()
}

#[tokio::test]
async fn append_and_flush_updates_registry_and_flags() {
    let (_temp_dir, _config, engine) = create_engine().await;
    let key = IndexKey::new(1, VectorType::ConversationSegment);
    let first = create_segment(&engine, 1).await;
    let second = create_segment(&engine, 1).await;

    let outcome = engine
        .append_entry(key, first, &unit(0), "first")
        .await
        .expect("append");
    assert_eq!(outcome, AppendOutcome::Appended { position: 0 });
    let outcome = engine
        .append_entry(key, second, &unit(1), "second")
        .await
        .expect("append");
    assert_eq!(outcome, AppendOutcome::Appended { position: 1 });

    // Nothing is flagged or registered before the flush
    assert!(!is_vectorized(&engine, first).await);
    assert!(!engine.has_valid_index(key).await.expect("registry"));

    assert!(engine.flush_key(key).await.expect("flush"));
    assert!(!engine.flush_key(key).await.expect("second flush is a no-op"));

    let file = engine
        .database()
        .get_valid_index_file(1, VectorType::ConversationSegment)
        .await
        .expect("registry")
        .expect("valid row");
    assert_eq!(file.vector_count, 2);
    assert_eq!(file.dimension, DIM as i64);
    assert_eq!(file.file_path, "1_ConversationSegment.vec");
    assert!(engine.index_dir().join(&file.file_path).exists());

    assert!(is_vectorized(&engine, first).await);
    assert!(is_vectorized(&engine, second).await);
}

#[tokio::test]
async fn duplicate_entity_is_skipped() {
    let (_temp_dir, _config, engine) = create_engine().await;
    let key = IndexKey::new(1, VectorType::ConversationSegment);
    let segment = create_segment(&engine, 1).await;

    engine
        .append_entry(key, segment, &unit(0), "s")
        .await
        .expect("append");
    let again = engine
        .append_entry(key, segment, &unit(2), "s")
        .await
        .expect("append");

    assert_eq!(again, AppendOutcome::AlreadyPresent);
    assert_eq!(engine.working_len(key).await, Some(1));
}

#[tokio::test]
async fn wrong_dimension_leaves_no_trace() {
    let (_temp_dir, _config, engine) = create_engine().await;
    let key = IndexKey::new(1, VectorType::ConversationSegment);
    let segment = create_segment(&engine, 1).await;

    let result = engine.append_entry(key, segment, &[1.0, 2.0], "s").await;
    assert!(matches!(
        result,
        Err(VectorError::DimensionMismatch {
            expected: DIM,
            got: 2
        })
    ));

    let entries =
        VectorIndexEntryQueries::list_for_key(engine.database().pool(), 1, key.index_type)
            .await
            .expect("entries");
    assert!(entries.is_empty());
    assert_eq!(engine.working_len(key).await, Some(0));
}

#[tokio::test]
async fn persisted_index_reloads_exactly() {
    let (_temp_dir, config, engine) = create_engine().await;
    let key = IndexKey::new(9, VectorType::ConversationSegment);

    for axis in 0..3 {
        let segment = create_segment(&engine, 9).await;
        engine
            .append_entry(key, segment, &unit(axis), "s")
            .await
            .expect("append");
    }
    engine.flush_all().await.expect("flush");

    let before = engine.search(key, &unit(1), 3).await.expect("search");

    let reopened = reopen(&config).await;
    let loaded = reopened.load(key).await.expect("load");
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.vector(2), Some(&unit(2)[..]));

    let after = reopened.search(key, &unit(1), 3).await.expect("search");
    assert_eq!(before, after);
    assert_eq!(after.first().map(|n| n.position), Some(1));
}

#[tokio::test]
async fn unknown_key_loads_empty() {
    let (_temp_dir, _config, engine) = create_engine().await;
    let key = IndexKey::new(404, VectorType::Message);

    let index = engine.load(key).await.expect("load");
    assert!(index.is_empty());
    assert_eq!(index.dimension(), DIM);
    assert!(engine.search(key, &unit(0), 5).await.expect("search").is_empty());
}

#[tokio::test]
async fn corrupt_artifact_is_invalid_and_write_path_falls_back() {
    let (_temp_dir, config, engine) = create_engine().await;
    let key = IndexKey::new(3, VectorType::ConversationSegment);
    let old = create_segment(&engine, 3).await;

    engine
        .append_entry(key, old, &unit(0), "old")
        .await
        .expect("append");
    engine.flush_key(key).await.expect("flush");

    let path = engine.index_dir().join(storage::file_name(3, key.index_type));
    tokio::fs::write(&path, b"garbage").await.expect("corrupt");

    let reopened = reopen(&config).await;
    assert!(matches!(
        reopened.load(key).await,
        Err(VectorError::IndexInvalid { group_id: 3, .. })
    ));
    assert!(reopened.search(key, &unit(0), 1).await.is_err());

    let fresh = create_segment(&reopened, 3).await;
    let outcome = reopened
        .append_entry(key, fresh, &unit(1), "fresh")
        .await
        .expect("append after fallback");
    assert_eq!(outcome, AppendOutcome::Appended { position: 0 });

    // The retired vector is gone and its source is pending again
    assert!(!is_vectorized(&reopened, old).await);
    assert!(
        !VectorIndexEntryQueries::exists(reopened.database().pool(), 3, key.index_type, old)
            .await
            .expect("exists")
    );

    reopened.flush_key(key).await.expect("flush");
    let files = IndexFileQueries::list_for_key(reopened.database().pool(), 3, key.index_type)
        .await
        .expect("registry");
    assert_eq!(files.iter().filter(|f| f.is_valid).count(), 1);
    assert_eq!(files.iter().filter(|f| !f.is_valid).count(), 1);
}

#[tokio::test]
async fn missing_artifact_is_reported() {
    let (_temp_dir, config, engine) = create_engine().await;
    let key = IndexKey::new(4, VectorType::ConversationSegment);
    let segment = create_segment(&engine, 4).await;

    engine
        .append_entry(key, segment, &unit(0), "s")
        .await
        .expect("append");
    engine.flush_key(key).await.expect("flush");
    tokio::fs::remove_file(engine.index_dir().join(storage::file_name(4, key.index_type)))
        .await
        .expect("remove");

    let reopened = reopen(&config).await;
    assert!(matches!(
        reopened.load(key).await,
        Err(VectorError::IndexMissing { group_id: 4, .. })
    ));
}

#[tokio::test]
async fn dimension_change_invalidates_artifact() {
    let (_temp_dir, mut config, engine) = create_engine().await;
    let key = IndexKey::new(5, VectorType::ConversationSegment);
    let segment = create_segment(&engine, 5).await;

    engine
        .append_entry(key, segment, &unit(0), "s")
        .await
        .expect("append");
    engine.flush_key(key).await.expect("flush");

    config.ollama.embedding_dimension = 8;
    let reopened = reopen(&config).await;
    assert!(matches!(
        reopened.load(key).await,
        Err(VectorError::IndexInvalid { .. })
    ));
}

#[tokio::test]
async fn entries_past_the_artifact_are_reconciled() {
    let (_temp_dir, config, engine) = create_engine().await;
    let key = IndexKey::new(6, VectorType::ConversationSegment);
    let persisted = create_segment(&engine, 6).await;
    let lost = create_segment(&engine, 6).await;

    engine
        .append_entry(key, persisted, &unit(0), "kept")
        .await
        .expect("append");
    engine.flush_key(key).await.expect("flush");

    // Simulates a crash after the entry insert but before the persist
    engine
        .append_entry(key, lost, &unit(1), "lost")
        .await
        .expect("append");
    drop(engine);

    let reopened = reopen(&config).await;
    let retry = reopened
        .append_entry(key, lost, &unit(1), "lost")
        .await
        .expect("append after reconcile");
    assert_eq!(retry, AppendOutcome::Appended { position: 1 });

    reopened.flush_key(key).await.expect("flush");
    assert!(is_vectorized(&reopened, persisted).await);
    assert!(is_vectorized(&reopened, lost).await);

    let file = reopened
        .database()
        .get_valid_index_file(6, key.index_type)
        .await
        .expect("registry")
        .expect("valid row");
    assert_eq!(file.vector_count, 2);
}

#[tokio::test]
async fn generation_swap_replaces_mapping() {
    let (_temp_dir, _config, engine) = create_engine().await;
    let key = IndexKey::new(7, VectorType::ConversationSegment);
    let a = create_segment(&engine, 7).await;
    let b = create_segment(&engine, 7).await;

    engine
        .append_entry(key, a, &unit(0), "a")
        .await
        .expect("append");
    engine.flush_key(key).await.expect("flush");
    let old_file = engine
        .database()
        .get_valid_index_file(7, key.index_type)
        .await
        .expect("registry")
        .expect("valid row");

    let mut rebuilt = FlatIndex::new(DIM, DistanceMetric::L2);
    rebuilt.append(&unit(3)).expect("append");
    rebuilt.append(&unit(2)).expect("append");
    let entries = vec![
        NewVectorIndexEntry {
            group_id: 7,
            vector_type: key.index_type,
            entity_id: b,
            faiss_index: 0,
            content_summary: "b".to_string(),
        },
        NewVectorIndexEntry {
            group_id: 7,
            vector_type: key.index_type,
            entity_id: a,
            faiss_index: 1,
            content_summary: "a".to_string(),
        },
    ];

    engine
        .install_generation(key, rebuilt, entries)
        .await
        .expect("install");

    let new_file = engine
        .database()
        .get_valid_index_file(7, key.index_type)
        .await
        .expect("registry")
        .expect("valid row");
    assert_ne!(new_file.file_path, old_file.file_path);
    assert_eq!(new_file.vector_count, 2);

    let files = IndexFileQueries::list_for_key(engine.database().pool(), 7, key.index_type)
        .await
        .expect("registry");
    assert!(files.iter().any(|f| f.id == old_file.id && !f.is_valid));

    let nearest = engine.search(key, &unit(3), 1).await.expect("search");
    assert_eq!(nearest.first().map(|n| n.position), Some(0));
    assert!(is_vectorized(&engine, a).await);
    assert!(is_vectorized(&engine, b).await);
}

#[tokio::test]
async fn purge_orphans_compacts_positions() {
    let (_temp_dir, _config, engine) = create_engine().await;
    let key = IndexKey::new(10, VectorType::ConversationSegment);
    let mut segments = Vec::new();
    for axis in 0..3 {
        let segment = create_segment(&engine, 10).await;
        engine
            .append_entry(key, segment, &unit(axis), "s")
            .await
            .expect("append");
        segments.push(segment);
    }
    engine.flush_key(key).await.expect("flush");

    sqlx::query("DELETE FROM conversation_segments WHERE id = ?")
        .bind(segments[1])
        .execute(engine.database().pool())
        .await
        .expect("delete segment");

    assert_eq!(engine.purge_orphans(key).await.expect("purge"), 1);
    assert_eq!(engine.purge_orphans(key).await.expect("purge again"), 0);

    let entries = VectorIndexEntryQueries::list_for_key(engine.database().pool(), 10, key.index_type)
        .await
        .expect("entries");
    let mapping: Vec<(i64, i64)> = entries
        .iter()
        .map(|entry| (entry.entity_id, entry.faiss_index))
        .collect();
    assert_eq!(mapping, vec![(segments[0], 0), (segments[2], 1)]);

    let file = engine
        .database()
        .get_valid_index_file(10, key.index_type)
        .await
        .expect("registry")
        .expect("valid row");
    assert_eq!(file.vector_count, 2);
    assert_eq!(engine.working_len(key).await, Some(2));

    // The third vector moved down into the freed position
    let nearest = engine.search(key, &unit(2), 1).await.expect("search");
    assert_eq!(nearest.first().map(|n| n.position), Some(1));

    let next = create_segment(&engine, 10).await;
    let outcome = engine
        .append_entry(key, next, &unit(3), "next")
        .await
        .expect("append after purge");
    assert_eq!(outcome, AppendOutcome::Appended { position: 2 });
    engine.flush_key(key).await.expect("flush");

    let file = engine
        .database()
        .get_valid_index_file(10, key.index_type)
        .await
        .expect("registry")
        .expect("valid row");
    assert_eq!(file.vector_count, 3);
}

#[tokio::test]
async fn search_leaves_crash_leftovers_to_the_next_write() {
    let (_temp_dir, config, engine) = create_engine().await;
    let key = IndexKey::new(11, VectorType::ConversationSegment);
    let persisted = create_segment(&engine, 11).await;
    let lost = create_segment(&engine, 11).await;

    engine
        .append_entry(key, persisted, &unit(0), "kept")
        .await
        .expect("append");
    engine.flush_key(key).await.expect("flush");
    engine
        .append_entry(key, lost, &unit(1), "lost")
        .await
        .expect("append");
    drop(engine);

    let reopened = reopen(&config).await;
    let hits = reopened.search(key, &unit(1), 5).await.expect("search");
    assert_eq!(hits.len(), 1);

    assert_eq!(
        entry_count(&reopened, key).await,
        2,
        "search must not touch the mapping"
    );

    let other = create_segment(&reopened, 11).await;
    reopened
        .append_entry(key, other, &unit(2), "other")
        .await
        .expect("append");
    assert!(
        !VectorIndexEntryQueries::exists(reopened.database().pool(), 11, key.index_type, lost)
            .await
            .expect("exists")
    );
    assert_eq!(entry_count(&reopened, key).await, 2);
}

#[tokio::test]
async fn cache_drops_least_recently_used_clean_copies() {
    let (_temp_dir, mut config, _engine) = create_engine().await;
    config.index.max_cached_indexes = 2;
    let engine = reopen(&config).await;

    let first = IndexKey::new(21, VectorType::ConversationSegment);
    let second = IndexKey::new(22, VectorType::ConversationSegment);
    let third = IndexKey::new(23, VectorType::ConversationSegment);

    let segment = create_segment(&engine, 21).await;
    engine
        .append_entry(first, segment, &unit(0), "first")
        .await
        .expect("append");

    let segment = create_segment(&engine, 22).await;
    engine
        .append_entry(second, segment, &unit(1), "second")
        .await
        .expect("append");
    engine.flush_key(second).await.expect("flush");

    let segment = create_segment(&engine, 23).await;
    engine
        .append_entry(third, segment, &unit(2), "third")
        .await
        .expect("append");

    // The oldest key has unpersisted writes, so the clean one goes
    assert_eq!(engine.cached_keys(), 2);
    assert_eq!(engine.working_len(first).await, Some(1));
    assert_eq!(engine.working_len(second).await, None);

    engine.flush_all().await.expect("flush");

    let hits = engine.search(second, &unit(1), 1).await.expect("search");
    assert_eq!(hits.first().map(|n| n.position), Some(0));
    assert_eq!(engine.cached_keys(), 2);

    let hits = engine.search(first, &unit(0), 1).await.expect("search");
    assert_eq!(hits.first().map(|n| n.position), Some(0));
    assert!(engine.cached_keys() <= 2);
}
