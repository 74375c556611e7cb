
use std::collections::HashSet;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

/// Kind of entity a vector was computed from. Doubles as the index type of
/// the artifact holding those vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT")]
pub enum VectorType {
    #[default]
    ConversationSegment,
    Message,
}

impl VectorType {
    pub const ALL: [VectorType; 2] = [VectorType::ConversationSegment, VectorType::Message];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            VectorType::ConversationSegment => "ConversationSegment",
            VectorType::Message => "Message",
        }
    }
}

impl std::fmt::Display for VectorType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VectorType {
    type Err = String;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conversationsegment" | "conversation-segment" | "segment" => {
                Ok(VectorType::ConversationSegment)
            }
            "message" => Ok(VectorType::Message),
            other => Err(format!("unknown vector type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct VectorIndexEntry {
    pub id: i64,
    pub group_id: i64,
    pub vector_type: VectorType,
    pub entity_id: i64,
    /// Position of the vector inside the group's index artifact
    pub faiss_index: i64,
    pub content_summary: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVectorIndexEntry {
    pub group_id: i64,
    pub vector_type: VectorType,
    pub entity_id: i64,
    pub faiss_index: i64,
    pub content_summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct IndexFile {
    pub id: i64,
    pub group_id: i64,
    pub index_type: VectorType,
    pub file_path: String,
    pub dimension: i64,
    pub vector_count: i64,
    pub file_size: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub is_valid: bool,
}

/// Values written to the registry when an artifact is persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFileRecord {
    pub group_id: i64,
    pub index_type: VectorType,
    pub file_path: String,
    pub dimension: i64,
    pub vector_count: i64,
    pub file_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ConversationSegment {
    pub id: i64,
    pub group_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub message_count: i64,
    pub participant_count: i64,
    pub content_summary: String,
    pub topic_keywords: String,
    pub full_content: String,
    pub is_vectorized: bool,
    pub created_at: NaiveDateTime,
}

impl ConversationSegment {
    #[inline]
    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes().max(0)
    }

    #[inline]
    pub fn keywords(&self) -> Vec<&str> {
        self.topic_keywords
            .split(',')
            .map(str::trim)
            .filter(|keyword| !keyword.is_empty())
            .collect()
    }
}

/// A segment as handed in by the upstream segmenter, with its messages in
/// conversation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversationSegment {
    pub group_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    #[serde(default)]
    pub content_summary: String,
    #[serde(default)]
    pub topic_keywords: Vec<String>,
    #[serde(default)]
    pub full_content: String,
    #[serde(default)]
    pub messages: Vec<NewMessage>,
}

impl NewConversationSegment {
    #[inline]
    pub fn participant_count(&self) -> i64 {
        let participants: HashSet<i64> = self.messages.iter().map(|m| m.from_user_id).collect();
        participants.len() as i64
    }

    /// Full content falls back to the concatenated message texts
    #[inline]
    pub fn resolved_full_content(&self) -> String {
        if !self.full_content.trim().is_empty() {
            return self.full_content.clone();
        }
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub group_id: i64,
    /// Chat-platform message id, unique within the group
    pub message_id: i64,
    pub from_user_id: i64,
    pub content: String,
    pub date_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: i64,
    pub from_user_id: i64,
    pub content: String,
    pub date_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TypeCount {
    pub vector_type: VectorType,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GroupSegmentCount {
    pub group_id: i64,
    pub segment_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorStatistics {
    pub total_segments: i64,
    pub vectorized_segments: i64,
    pub pending_segments: i64,
    pub entries_by_type: Vec<TypeCount>,
    pub top_groups: Vec<GroupSegmentCount>,
}

impl VectorStatistics {
    #[inline]
    pub fn vectorized_percentage(&self) -> f64 {
        if self.total_segments == 0 {
            0.0
        } else {
            (self.vectorized_segments as f64 / self.total_segments as f64) * 100.0
        }
    }
}
