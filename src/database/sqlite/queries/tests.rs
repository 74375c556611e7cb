use super::*;
use crate::database::sqlite::Database;
use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

async fn create_test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("Failed to create test database");

    (temp_dir, database.pool().clone())
}

fn at(minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, minute, 0))
        .expect("valid timestamp")
}

fn sample_segment(group_id: i64, first_message: i64) -> NewConversationSegment {
    NewConversationSegment {
        group_id,
        start_time: at(0),
        end_time: at(10),
        content_summary: "deploy discussion".to_string(),
        topic_keywords: vec!["deploy".to_string(), "rollback".to_string()],
        full_content: String::new(),
        messages: (0..3)
            .map(|i| NewMessage {
                message_id: first_message + i,
                from_user_id: 10 + (i % 2),
                content: format!("message {}", first_message + i),
                date_time: at(i as u32),
            })
            .collect(),
    }
}

fn entry(group_id: i64, entity_id: i64, position: i64) -> NewVectorIndexEntry {
    NewVectorIndexEntry {
        group_id,
        vector_type: VectorType::ConversationSegment,
        entity_id,
        faiss_index: position,
        content_summary: format!("summary {entity_id}"),
    }
}

fn record(group_id: i64, path: &str, count: i64) -> IndexFileRecord {
    IndexFileRecord {
        group_id,
        index_type: VectorType::ConversationSegment,
        file_path: path.to_string(),
        dimension: 8,
        vector_count: count,
        file_size: 24 + count * 32 + 4,
    }
}

#[tokio::test]
async fn segment_creation_links_messages_in_order() {
    let (_temp_dir, pool) = create_test_pool().await;

    let segment = SegmentQueries::create(&pool, &sample_segment(7, 100))
        .await
        .expect("Failed to create segment");

    assert_eq!(segment.group_id, 7);
    assert_eq!(segment.message_count, 3);
    assert_eq!(segment.participant_count, 2);
    assert_eq!(segment.first_message_id, 100);
    assert_eq!(segment.last_message_id, 102);
    assert_eq!(segment.topic_keywords, "deploy,rollback");
    assert_eq!(segment.full_content, "message 100\nmessage 101\nmessage 102");
    assert!(!segment.is_vectorized);

    let messages = SegmentQueries::get_messages(&pool, segment.id)
        .await
        .expect("Failed to load messages");
    let ids: Vec<i64> = messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![100, 101, 102]);
}

#[tokio::test]
async fn overlapping_segments_share_messages() {
    let (_temp_dir, pool) = create_test_pool().await;

    SegmentQueries::create(&pool, &sample_segment(7, 100))
        .await
        .expect("Failed to create first segment");
    let second = SegmentQueries::create(&pool, &sample_segment(7, 102))
        .await
        .expect("Failed to create second segment");

    let group_messages = MessageQueries::list_by_group(&pool, 7)
        .await
        .expect("Failed to list messages");
    assert_eq!(group_messages.len(), 5);

    let second_messages = SegmentQueries::get_messages(&pool, second.id)
        .await
        .expect("Failed to load messages");
    assert_eq!(second_messages.first().map(|m| m.message_id), Some(102));
}

#[tokio::test]
async fn entry_uniqueness_is_enforced() {
    let (_temp_dir, pool) = create_test_pool().await;
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");

    VectorIndexEntryQueries::insert(&mut conn, &entry(1, 10, 0))
        .await
        .expect("Failed to insert entry");

    let same_entity = VectorIndexEntryQueries::insert(&mut conn, &entry(1, 10, 1)).await;
    assert!(same_entity.is_err());

    let same_position = VectorIndexEntryQueries::insert(&mut conn, &entry(1, 11, 0)).await;
    assert!(same_position.is_err());

    // Same entity and position in another group is fine
    VectorIndexEntryQueries::insert(&mut conn, &entry(2, 10, 0))
        .await
        .expect("Failed to insert entry for second group");

    assert!(
        VectorIndexEntryQueries::exists(&pool, 1, VectorType::ConversationSegment, 10)
            .await
            .expect("Failed to check entry")
    );
    assert!(
        !VectorIndexEntryQueries::exists(&pool, 1, VectorType::Message, 10)
            .await
            .expect("Failed to check entry")
    );
}

#[tokio::test]
async fn position_lookup_and_truncation() {
    let (_temp_dir, pool) = create_test_pool().await;
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");

    for (entity, position) in [(10, 0), (11, 1), (12, 2), (13, 3)] {
        VectorIndexEntryQueries::insert(&mut conn, &entry(1, entity, position))
            .await
            .expect("Failed to insert entry");
    }

    let resolved = VectorIndexEntryQueries::get_by_positions(
        &pool,
        1,
        VectorType::ConversationSegment,
        &[3, 1, 9],
    )
    .await
    .expect("Failed to resolve positions");
    let entities: Vec<i64> = resolved.iter().map(|e| e.entity_id).collect();
    assert_eq!(entities, vec![11, 13]);

    let max = VectorIndexEntryQueries::max_position(&pool, 1, VectorType::ConversationSegment)
        .await
        .expect("Failed to get max position");
    assert_eq!(max, Some(3));

    let mut removed =
        VectorIndexEntryQueries::delete_from_position(&mut conn, 1, VectorType::ConversationSegment, 2)
            .await
            .expect("Failed to truncate entries");
    removed.sort_unstable();
    assert_eq!(removed, vec![12, 13]);

    let count = VectorIndexEntryQueries::count_for_key(&mut conn, 1, VectorType::ConversationSegment)
        .await
        .expect("Failed to count entries");
    assert_eq!(count, 2);

    let empty = VectorIndexEntryQueries::max_position(&pool, 99, VectorType::ConversationSegment)
        .await
        .expect("Failed to get max position");
    assert_eq!(empty, None);
}

#[tokio::test]
async fn single_valid_index_file_per_key() {
    let (_temp_dir, pool) = create_test_pool().await;
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");

    IndexFileQueries::upsert_valid(&mut conn, &record(1, "1_ConversationSegment.vec", 2))
        .await
        .expect("Failed to insert record");
    IndexFileQueries::upsert_valid(&mut conn, &record(1, "1_ConversationSegment.vec", 5))
        .await
        .expect("Failed to update record");

    let files = IndexFileQueries::list_for_key(&pool, 1, VectorType::ConversationSegment)
        .await
        .expect("Failed to list records");
    assert_eq!(files.len(), 1);
    assert_eq!(files.first().map(|f| f.vector_count), Some(5));

    // A second valid row for the same key violates the partial unique index
    let duplicate = IndexFileQueries::insert_valid(&mut conn, &record(1, "other.vec", 1)).await;
    assert!(duplicate.is_err());

    let invalidated = IndexFileQueries::invalidate(&mut conn, 1, VectorType::ConversationSegment)
        .await
        .expect("Failed to invalidate");
    assert_eq!(invalidated, 1);
    assert!(
        IndexFileQueries::get_valid(&pool, 1, VectorType::ConversationSegment)
            .await
            .expect("Failed to get valid record")
            .is_none()
    );

    IndexFileQueries::insert_valid(&mut conn, &record(1, "1_ConversationSegment_gen2.vec", 3))
        .await
        .expect("Failed to insert new generation");
    let all = IndexFileQueries::list_for_key(&pool, 1, VectorType::ConversationSegment)
        .await
        .expect("Failed to list records");
    assert_eq!(all.len(), 2);

    let deleted = IndexFileQueries::delete_invalid(&pool)
        .await
        .expect("Failed to delete invalid records");
    assert_eq!(deleted, 1);
    assert_eq!(
        IndexFileQueries::list_valid(&pool)
            .await
            .expect("Failed to list valid records")
            .len(),
        1
    );
}

#[tokio::test]
async fn vectorized_flags_and_statistics() {
    let (_temp_dir, pool) = create_test_pool().await;

    let first = SegmentQueries::create(&pool, &sample_segment(1, 100))
        .await
        .expect("Failed to create segment");
    let second = SegmentQueries::create(&pool, &sample_segment(1, 200))
        .await
        .expect("Failed to create segment");
    SegmentQueries::create(&pool, &sample_segment(2, 300))
        .await
        .expect("Failed to create segment");

    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    SegmentQueries::set_vectorized(&mut conn, &[first.id, second.id], true)
        .await
        .expect("Failed to flag segments");
    VectorIndexEntryQueries::insert(&mut conn, &entry(1, first.id, 0))
        .await
        .expect("Failed to insert entry");

    let pending = SegmentQueries::list_unvectorized(&pool, 1)
        .await
        .expect("Failed to list pending");
    assert!(pending.is_empty());

    let (total, vectorized) = SegmentQueries::count_totals(&pool)
        .await
        .expect("Failed to count");
    assert_eq!((total, vectorized), (3, 2));

    let flagged = SegmentQueries::list_flagged_without_entry(&pool)
        .await
        .expect("Failed to find flagged segments");
    assert_eq!(flagged, vec![second.id]);

    let top = SegmentQueries::top_groups(&pool, 10)
        .await
        .expect("Failed to rank groups");
    assert_eq!(top.first().map(|g| (g.group_id, g.segment_count)), Some((1, 2)));

    SegmentQueries::reset_group(&mut conn, 1)
        .await
        .expect("Failed to reset group");
    assert_eq!(
        SegmentQueries::list_unvectorized(&pool, 1)
            .await
            .expect("Failed to list pending")
            .len(),
        2
    );
}

#[tokio::test]
async fn orphaned_entries_are_listed_per_key() {
    let (_temp_dir, pool) = create_test_pool().await;

    let segment = SegmentQueries::create(&pool, &sample_segment(1, 100))
        .await
        .expect("Failed to create segment");
    SegmentQueries::create(&pool, &sample_segment(2, 200))
        .await
        .expect("Failed to create segment");

    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    VectorIndexEntryQueries::insert(&mut conn, &entry(1, segment.id, 0))
        .await
        .expect("Failed to insert entry");
    VectorIndexEntryQueries::insert(&mut conn, &entry(1, 9_999, 1))
        .await
        .expect("Failed to insert orphan entry");
    VectorIndexEntryQueries::insert(&mut conn, &entry(3, 8_888, 0))
        .await
        .expect("Failed to insert orphan entry");

    let keys = VectorIndexEntryQueries::list_orphan_keys(&pool)
        .await
        .expect("Failed to list orphan keys");
    assert_eq!(
        keys,
        vec![
            (1, VectorType::ConversationSegment),
            (3, VectorType::ConversationSegment)
        ]
    );

    let orphans = VectorIndexEntryQueries::list_orphans(&pool, 1, VectorType::ConversationSegment)
        .await
        .expect("Failed to list orphans");
    assert_eq!(orphans, vec![9_999]);

    // Listing never deletes
    let counts = VectorIndexEntryQueries::count_by_type(&pool)
        .await
        .expect("Failed to count by type");
    assert_eq!(
        counts,
        vec![TypeCount {
            vector_type: VectorType::ConversationSegment,
            count: 3
        }]
    );
}

#[tokio::test]
async fn unvectorized_messages_exclude_embedded_ones() {
    let (_temp_dir, pool) = create_test_pool().await;

    SegmentQueries::create(&pool, &sample_segment(3, 100))
        .await
        .expect("Failed to create segment");
    let messages = MessageQueries::list_by_group(&pool, 3)
        .await
        .expect("Failed to list messages");
    let first_id = messages.first().map(|m| m.id).expect("message exists");

    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    VectorIndexEntryQueries::insert(
        &mut conn,
        &NewVectorIndexEntry {
            group_id: 3,
            vector_type: VectorType::Message,
            entity_id: first_id,
            faiss_index: 0,
            content_summary: String::new(),
        },
    )
    .await
    .expect("Failed to insert entry");

    let pending = MessageQueries::list_unvectorized(&pool, 3)
        .await
        .expect("Failed to list pending messages");
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|m| m.id != first_id));
}
