
use std::fmt::Write as _;

use crate::database::sqlite::{ConversationSegment, Message, VectorType};

/// Text handed to the embedding provider for one source entity, plus the
/// bounded summary stored alongside its vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorDocument {
    pub entity_id: i64,
    pub group_id: i64,
    pub vector_type: VectorType,
    pub content: String,
    pub summary: String,
}

impl VectorDocument {
    #[inline]
    pub fn from_segment(segment: &ConversationSegment, summary_max_chars: usize) -> Self {
        let summary = if segment.content_summary.trim().is_empty() {
            &segment.full_content
        } else {
            &segment.content_summary
        };

        Self {
            entity_id: segment.id,
            group_id: segment.group_id,
            vector_type: VectorType::ConversationSegment,
            content: build_segment_content(segment),
            summary: truncate_chars(summary, summary_max_chars),
        }
    }

    #[inline]
    pub fn from_message(message: &Message, summary_max_chars: usize) -> Self {
        Self {
            entity_id: message.id,
            group_id: message.group_id,
            vector_type: VectorType::Message,
            content: message.content.clone(),
            summary: truncate_chars(&message.content, summary_max_chars),
        }
    }
}

/// Rough shape of a conversation by how many people took part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    SingleSpeaker,
    SmallGroup,
    MultiParty,
}

impl ConversationKind {
    #[inline]
    pub fn from_participants(participants: i64) -> Self {
        match participants {
            ..=1 => ConversationKind::SingleSpeaker,
            2..=3 => ConversationKind::SmallGroup,
            _ => ConversationKind::MultiParty,
        }
    }
}

impl std::fmt::Display for ConversationKind {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ConversationKind::SingleSpeaker => write!(f, "single speaker"),
            ConversationKind::SmallGroup => write!(f, "small group discussion"),
            ConversationKind::MultiParty => write!(f, "multi-party discussion"),
        }
    }
}

/// Builds the embedded text of a segment: time range, head counts, topic,
/// summary, duration and kind, then the conversation itself.
#[inline]
pub fn build_segment_content(segment: &ConversationSegment) -> String {
    let mut content = String::new();

    let _ = writeln!(
        content,
        "Time: {} - {}",
        segment.start_time.format("%Y-%m-%d %H:%M"),
        segment.end_time.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(content, "Participants: {}", segment.participant_count);
    let _ = writeln!(content, "Messages: {}", segment.message_count);

    let keywords = segment.keywords();
    if !keywords.is_empty() {
        let _ = writeln!(content, "Topic keywords: {}", keywords.join(", "));
    }

    if !segment.content_summary.trim().is_empty() {
        let _ = writeln!(content, "Summary: {}", segment.content_summary.trim());
    }

    let seconds = (segment.end_time - segment.start_time).num_seconds();
    if seconds > 0 {
        let _ = writeln!(content, "Duration: {:.1} minutes", seconds as f64 / 60.0);
    }

    let _ = writeln!(
        content,
        "Conversation type: {}",
        ConversationKind::from_participants(segment.participant_count)
    );

    content.push_str("Conversation:\n");
    content.push_str(&segment.full_content);

    content
}

/// Truncates to at most `max_chars` characters, never splitting a code point
#[inline]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text.get(..byte_index).unwrap_or(text).to_string(),
        None => text.to_string(),
    }
}
