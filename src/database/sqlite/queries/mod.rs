#[cfg(test)]
mod tests;

use super::models::*;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

const ENTRY_COLUMNS: &str = "id, group_id, vector_type, entity_id, faiss_index, content_summary, created_at, updated_at";
const INDEX_FILE_COLUMNS: &str = "id, group_id, index_type, file_path, dimension, vector_count, file_size, created_at, updated_at, is_valid";
const SEGMENT_COLUMNS: &str = "id, group_id, start_time, end_time, first_message_id, last_message_id, message_count, participant_count, content_summary, topic_keywords, full_content, is_vectorized, created_at";

pub struct VectorIndexEntryQueries;

impl VectorIndexEntryQueries {
    #[inline]
    pub async fn get_by_entity(
        pool: &SqlitePool,
        group_id: i64,
        vector_type: VectorType,
        entity_id: i64,
    ) -> Result<Option<VectorIndexEntry>> {
        let entry = sqlx::query_as::<_, VectorIndexEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM vector_index_entries
             WHERE group_id = ? AND vector_type = ? AND entity_id = ?"
        ))
        .bind(group_id)
        .bind(vector_type)
        .bind(entity_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get vector index entry by entity")?;

        Ok(entry)
    }

    #[inline]
    pub async fn exists(
        pool: &SqlitePool,
        group_id: i64,
        vector_type: VectorType,
        entity_id: i64,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM vector_index_entries
             WHERE group_id = ? AND vector_type = ? AND entity_id = ?",
        )
        .bind(group_id)
        .bind(vector_type)
        .bind(entity_id)
        .fetch_optional(pool)
        .await
        .context("Failed to check vector index entry")?;

        Ok(found.is_some())
    }

    /// Reverse lookup from index positions, returned in position order
    #[inline]
    pub async fn get_by_positions(
        pool: &SqlitePool,
        group_id: i64,
        vector_type: VectorType,
        positions: &[i64],
    ) -> Result<Vec<VectorIndexEntry>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {ENTRY_COLUMNS} FROM vector_index_entries WHERE group_id = "
        ));
        builder.push_bind(group_id);
        builder.push(" AND vector_type = ");
        builder.push_bind(vector_type);
        builder.push(" AND faiss_index IN (");
        let mut separated = builder.separated(", ");
        for position in positions {
            separated.push_bind(*position);
        }
        separated.push_unseparated(") ORDER BY faiss_index");

        let entries = builder
            .build_query_as::<VectorIndexEntry>()
            .fetch_all(pool)
            .await
            .context("Failed to resolve vector index positions")?;

        Ok(entries)
    }

    #[inline]
    pub async fn list_for_key(
        pool: &SqlitePool,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<Vec<VectorIndexEntry>> {
        let entries = sqlx::query_as::<_, VectorIndexEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM vector_index_entries
             WHERE group_id = ? AND vector_type = ? ORDER BY faiss_index"
        ))
        .bind(group_id)
        .bind(vector_type)
        .fetch_all(pool)
        .await
        .context("Failed to list vector index entries")?;

        Ok(entries)
    }

    #[inline]
    pub async fn insert(conn: &mut SqliteConnection, entry: &NewVectorIndexEntry) -> Result<i64> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO vector_index_entries
                (group_id, vector_type, entity_id, faiss_index, content_summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.group_id)
        .bind(entry.vector_type)
        .bind(entry.entity_id)
        .bind(entry.faiss_index)
        .bind(&entry.content_summary)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "Failed to insert vector index entry for group {} ({}) entity {}",
                entry.group_id, entry.vector_type, entry.entity_id
            )
        })?
        .last_insert_rowid();

        Ok(id)
    }

    #[inline]
    pub async fn count_for_key(
        conn: &mut SqliteConnection,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vector_index_entries WHERE group_id = ? AND vector_type = ?",
        )
        .bind(group_id)
        .bind(vector_type)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to count vector index entries")?;

        Ok(count)
    }

    #[inline]
    pub async fn max_position(
        pool: &SqlitePool,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(faiss_index) FROM vector_index_entries WHERE group_id = ? AND vector_type = ?",
        )
        .bind(group_id)
        .bind(vector_type)
        .fetch_one(pool)
        .await
        .context("Failed to get highest vector position")?;

        Ok(max)
    }

    /// Deletes entries at or past `position`, returning their entity ids
    #[inline]
    pub async fn delete_from_position(
        conn: &mut SqliteConnection,
        group_id: i64,
        vector_type: VectorType,
        position: i64,
    ) -> Result<Vec<i64>> {
        let entity_ids: Vec<i64> = sqlx::query_scalar(
            "DELETE FROM vector_index_entries
             WHERE group_id = ? AND vector_type = ? AND faiss_index >= ?
             RETURNING entity_id",
        )
        .bind(group_id)
        .bind(vector_type)
        .bind(position)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to delete dangling vector index entries")?;

        if !entity_ids.is_empty() {
            warn!(
                "Removed {} entries past position {} for group {} ({})",
                entity_ids.len(),
                position,
                group_id,
                vector_type
            );
        }

        Ok(entity_ids)
    }

    /// Deletes every entry of a key, returning the affected entity ids
    #[inline]
    pub async fn delete_for_key(
        conn: &mut SqliteConnection,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<Vec<i64>> {
        Self::delete_from_position(conn, group_id, vector_type, 0).await
    }

    #[inline]
    pub async fn delete_by_entities(
        conn: &mut SqliteConnection,
        group_id: i64,
        vector_type: VectorType,
        entity_ids: &[i64],
    ) -> Result<u64> {
        if entity_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("DELETE FROM vector_index_entries WHERE group_id = ");
        builder.push_bind(group_id);
        builder.push(" AND vector_type = ");
        builder.push_bind(vector_type);
        builder.push(" AND entity_id IN (");
        let mut separated = builder.separated(", ");
        for entity_id in entity_ids {
            separated.push_bind(*entity_id);
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .context("Failed to delete vector index entries by entity")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn count_by_type(pool: &SqlitePool) -> Result<Vec<TypeCount>> {
        let counts = sqlx::query_as::<_, TypeCount>(
            "SELECT vector_type, COUNT(*) AS count FROM vector_index_entries
             GROUP BY vector_type ORDER BY vector_type",
        )
        .fetch_all(pool)
        .await
        .context("Failed to count vector index entries by type")?;

        Ok(counts)
    }

    /// Distinct `(group_id, vector_type)` keys that have entries
    #[inline]
    pub async fn list_keys(pool: &SqlitePool) -> Result<Vec<(i64, VectorType)>> {
        let keys = sqlx::query_as::<_, (i64, VectorType)>(
            "SELECT DISTINCT group_id, vector_type FROM vector_index_entries
             ORDER BY group_id, vector_type",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list vector index keys")?;

        Ok(keys)
    }

    /// Keys holding at least one entry whose source entity no longer exists
    #[inline]
    pub async fn list_orphan_keys(pool: &SqlitePool) -> Result<Vec<(i64, VectorType)>> {
        let keys = sqlx::query_as::<_, (i64, VectorType)>(
            "SELECT DISTINCT group_id, vector_type FROM vector_index_entries
             WHERE (vector_type = ? AND entity_id NOT IN (SELECT id FROM conversation_segments))
                OR (vector_type = ? AND entity_id NOT IN (SELECT id FROM messages))
             ORDER BY group_id, vector_type",
        )
        .bind(VectorType::ConversationSegment)
        .bind(VectorType::Message)
        .fetch_all(pool)
        .await
        .context("Failed to list keys with orphaned entries")?;

        debug!("{} keys hold orphaned entries", keys.len());
        Ok(keys)
    }

    /// Entity ids of the key's entries whose source entity no longer exists
    #[inline]
    pub async fn list_orphans(
        pool: &SqlitePool,
        group_id: i64,
        vector_type: VectorType,
    ) -> Result<Vec<i64>> {
        let source = match vector_type {
            VectorType::ConversationSegment => "conversation_segments",
            VectorType::Message => "messages",
        };
        let orphans: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT entity_id FROM vector_index_entries
             WHERE group_id = ? AND vector_type = ? AND entity_id NOT IN (SELECT id FROM {source})
             ORDER BY faiss_index"
        ))
        .bind(group_id)
        .bind(vector_type)
        .fetch_all(pool)
        .await
        .context("Failed to list orphaned vector index entries")?;

        Ok(orphans)
    }
}

pub struct IndexFileQueries;

impl IndexFileQueries {
    #[inline]
    pub async fn get_valid(
        pool: &SqlitePool,
        group_id: i64,
        index_type: VectorType,
    ) -> Result<Option<IndexFile>> {
        let file = sqlx::query_as::<_, IndexFile>(&format!(
            "SELECT {INDEX_FILE_COLUMNS} FROM index_files
             WHERE group_id = ? AND index_type = ? AND is_valid = 1"
        ))
        .bind(group_id)
        .bind(index_type)
        .fetch_optional(pool)
        .await
        .context("Failed to get valid index file")?;

        Ok(file)
    }

    /// Updates the valid row for the key in place, or inserts one
    #[inline]
    pub async fn upsert_valid(conn: &mut SqliteConnection, record: &IndexFileRecord) -> Result<()> {
        let now = Utc::now().naive_utc();
        let updated = sqlx::query(
            "UPDATE index_files
             SET file_path = ?, dimension = ?, vector_count = ?, file_size = ?, updated_at = ?
             WHERE group_id = ? AND index_type = ? AND is_valid = 1",
        )
        .bind(&record.file_path)
        .bind(record.dimension)
        .bind(record.vector_count)
        .bind(record.file_size)
        .bind(now)
        .bind(record.group_id)
        .bind(record.index_type)
        .execute(&mut *conn)
        .await
        .context("Failed to update index file record")?
        .rows_affected();

        if updated == 0 {
            Self::insert_valid(conn, record).await?;
        }

        Ok(())
    }

    #[inline]
    pub async fn insert_valid(conn: &mut SqliteConnection, record: &IndexFileRecord) -> Result<i64> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO index_files
                (group_id, index_type, file_path, dimension, vector_count, file_size, created_at, updated_at, is_valid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(record.group_id)
        .bind(record.index_type)
        .bind(&record.file_path)
        .bind(record.dimension)
        .bind(record.vector_count)
        .bind(record.file_size)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "Failed to insert index file record for group {} ({})",
                record.group_id, record.index_type
            )
        })?
        .last_insert_rowid();

        Ok(id)
    }

    #[inline]
    pub async fn invalidate(
        conn: &mut SqliteConnection,
        group_id: i64,
        index_type: VectorType,
    ) -> Result<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            "UPDATE index_files SET is_valid = 0, updated_at = ?
             WHERE group_id = ? AND index_type = ? AND is_valid = 1",
        )
        .bind(now)
        .bind(group_id)
        .bind(index_type)
        .execute(&mut *conn)
        .await
        .context("Failed to invalidate index file record")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn list_valid(pool: &SqlitePool) -> Result<Vec<IndexFile>> {
        let files = sqlx::query_as::<_, IndexFile>(&format!(
            "SELECT {INDEX_FILE_COLUMNS} FROM index_files WHERE is_valid = 1
             ORDER BY group_id, index_type"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list valid index files")?;

        Ok(files)
    }

    #[inline]
    pub async fn list_for_key(
        pool: &SqlitePool,
        group_id: i64,
        index_type: VectorType,
    ) -> Result<Vec<IndexFile>> {
        let files = sqlx::query_as::<_, IndexFile>(&format!(
            "SELECT {INDEX_FILE_COLUMNS} FROM index_files WHERE group_id = ? AND index_type = ?
             ORDER BY id"
        ))
        .bind(group_id)
        .bind(index_type)
        .fetch_all(pool)
        .await
        .context("Failed to list index files for key")?;

        Ok(files)
    }

    #[inline]
    pub async fn delete_invalid(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM index_files WHERE is_valid = 0")
            .execute(pool)
            .await
            .context("Failed to delete invalid index files")?;

        Ok(result.rows_affected())
    }
}

pub struct SegmentQueries;

impl SegmentQueries {
    /// Stores a segment together with its messages and their order
    #[inline]
    pub async fn create(
        pool: &SqlitePool,
        new_segment: &NewConversationSegment,
    ) -> Result<ConversationSegment> {
        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for segment insert")?;

        let now = Utc::now().naive_utc();
        let first_message_id = new_segment.messages.first().map_or(0, |m| m.message_id);
        let last_message_id = new_segment.messages.last().map_or(0, |m| m.message_id);

        let segment_id = sqlx::query(
            "INSERT INTO conversation_segments
                (group_id, start_time, end_time, first_message_id, last_message_id, message_count,
                 participant_count, content_summary, topic_keywords, full_content, is_vectorized, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(new_segment.group_id)
        .bind(new_segment.start_time)
        .bind(new_segment.end_time)
        .bind(first_message_id)
        .bind(last_message_id)
        .bind(new_segment.messages.len() as i64)
        .bind(new_segment.participant_count())
        .bind(&new_segment.content_summary)
        .bind(new_segment.topic_keywords.join(","))
        .bind(new_segment.resolved_full_content())
        .bind(now)
        .execute(&mut *transaction)
        .await
        .context("Failed to insert conversation segment")?
        .last_insert_rowid();

        for (order, message) in new_segment.messages.iter().enumerate() {
            let message_row_id =
                MessageQueries::upsert(&mut *transaction, new_segment.group_id, message).await?;

            sqlx::query(
                "INSERT OR IGNORE INTO conversation_segment_messages (segment_id, message_id, sequence_order)
                 VALUES (?, ?, ?)",
            )
            .bind(segment_id)
            .bind(message_row_id)
            .bind(order as i64)
            .execute(&mut *transaction)
            .await
            .context("Failed to link message to segment")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit segment insert transaction")?;

        debug!(
            "Stored segment {} for group {} with {} messages",
            segment_id,
            new_segment.group_id,
            new_segment.messages.len()
        );

        Self::get_by_id(pool, segment_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created segment"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<ConversationSegment>> {
        let segment = sqlx::query_as::<_, ConversationSegment>(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM conversation_segments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get segment by id")?;

        Ok(segment)
    }

    #[inline]
    pub async fn list_by_group(pool: &SqlitePool, group_id: i64) -> Result<Vec<ConversationSegment>> {
        let segments = sqlx::query_as::<_, ConversationSegment>(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM conversation_segments WHERE group_id = ?
             ORDER BY start_time, id"
        ))
        .bind(group_id)
        .fetch_all(pool)
        .await
        .context("Failed to list segments for group")?;

        Ok(segments)
    }

    #[inline]
    pub async fn list_unvectorized(
        pool: &SqlitePool,
        group_id: i64,
    ) -> Result<Vec<ConversationSegment>> {
        let segments = sqlx::query_as::<_, ConversationSegment>(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM conversation_segments
             WHERE group_id = ? AND is_vectorized = 0 ORDER BY start_time, id"
        ))
        .bind(group_id)
        .fetch_all(pool)
        .await
        .context("Failed to list unvectorized segments")?;

        Ok(segments)
    }

    #[inline]
    pub async fn set_vectorized(
        conn: &mut SqliteConnection,
        segment_ids: &[i64],
        vectorized: bool,
    ) -> Result<u64> {
        if segment_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("UPDATE conversation_segments SET is_vectorized = ");
        builder.push_bind(vectorized);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in segment_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .context("Failed to update segment vectorized flags")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn reset_group(conn: &mut SqliteConnection, group_id: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE conversation_segments SET is_vectorized = 0 WHERE group_id = ?")
                .bind(group_id)
                .execute(&mut *conn)
                .await
                .context("Failed to reset segment vectorized flags")?;

        Ok(result.rows_affected())
    }

    /// Messages of a segment in conversation order
    #[inline]
    pub async fn get_messages(pool: &SqlitePool, segment_id: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT m.id, m.group_id, m.message_id, m.from_user_id, m.content, m.date_time
             FROM conversation_segment_messages sm
             JOIN messages m ON m.id = sm.message_id
             WHERE sm.segment_id = ?
             ORDER BY sm.sequence_order",
        )
        .bind(segment_id)
        .fetch_all(pool)
        .await
        .context("Failed to get segment messages")?;

        Ok(messages)
    }

    /// Returns `(total, vectorized)`
    #[inline]
    pub async fn count_totals(pool: &SqlitePool) -> Result<(i64, i64)> {
        let totals: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_vectorized = 1 THEN 1 ELSE 0 END), 0)
             FROM conversation_segments",
        )
        .fetch_one(pool)
        .await
        .context("Failed to count segments")?;

        Ok(totals)
    }

    #[inline]
    pub async fn top_groups(pool: &SqlitePool, limit: i64) -> Result<Vec<GroupSegmentCount>> {
        let groups = sqlx::query_as::<_, GroupSegmentCount>(
            "SELECT group_id, COUNT(*) AS segment_count FROM conversation_segments
             GROUP BY group_id ORDER BY segment_count DESC, group_id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to rank groups by segment count")?;

        Ok(groups)
    }

    /// Segments flagged vectorized that have no entry backing them
    #[inline]
    pub async fn list_flagged_without_entry(pool: &SqlitePool) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT s.id FROM conversation_segments s
             WHERE s.is_vectorized = 1 AND NOT EXISTS (
                 SELECT 1 FROM vector_index_entries e
                 WHERE e.group_id = s.group_id AND e.vector_type = ? AND e.entity_id = s.id
             )
             ORDER BY s.id",
        )
        .bind(VectorType::ConversationSegment)
        .fetch_all(pool)
        .await
        .context("Failed to find segments flagged without entries")?;

        Ok(ids)
    }
}

pub struct MessageQueries;

impl MessageQueries {
    /// Inserts the message or returns the row id of the existing one
    #[inline]
    pub async fn upsert(
        conn: &mut SqliteConnection,
        group_id: i64,
        message: &NewMessage,
    ) -> Result<i64> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages (group_id, message_id, from_user_id, content, date_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(group_id)
        .bind(message.message_id)
        .bind(message.from_user_id)
        .bind(&message.content)
        .bind(message.date_time)
        .execute(&mut *conn)
        .await
        .context("Failed to insert message")?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM messages WHERE group_id = ? AND message_id = ?")
                .bind(group_id)
                .bind(message.message_id)
                .fetch_one(&mut *conn)
                .await
                .context("Failed to look up message row id")?;

        Ok(id)
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            "SELECT id, group_id, message_id, from_user_id, content, date_time FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get message by id")?;

        Ok(message)
    }

    #[inline]
    pub async fn list_by_group(pool: &SqlitePool, group_id: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, group_id, message_id, from_user_id, content, date_time FROM messages
             WHERE group_id = ? ORDER BY date_time, id",
        )
        .bind(group_id)
        .fetch_all(pool)
        .await
        .context("Failed to list messages for group")?;

        Ok(messages)
    }

    /// Messages with no `Message` vector entry yet
    #[inline]
    pub async fn list_unvectorized(pool: &SqlitePool, group_id: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT m.id, m.group_id, m.message_id, m.from_user_id, m.content, m.date_time
             FROM messages m
             WHERE m.group_id = ? AND NOT EXISTS (
                 SELECT 1 FROM vector_index_entries e
                 WHERE e.group_id = m.group_id AND e.vector_type = ? AND e.entity_id = m.id
             )
             ORDER BY m.date_time, m.id",
        )
        .bind(group_id)
        .bind(VectorType::Message)
        .fetch_all(pool)
        .await
        .context("Failed to list unvectorized messages")?;

        Ok(messages)
    }
}
