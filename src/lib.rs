use thiserror::Error;

use crate::database::sqlite::VectorType;

pub type Result<T> = std::result::Result<T, VectorError>;

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding timed out after {seconds}s")]
    EmbeddingTimeout { seconds: u64 },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index for group {group_id} ({index_type}) is invalid: {reason}")]
    IndexInvalid {
        group_id: i64,
        index_type: VectorType,
        reason: String,
    },

    #[error("Index file for group {group_id} ({index_type}) is missing: {path}")]
    IndexMissing {
        group_id: i64,
        index_type: VectorType,
        path: String,
    },

    #[error("Concurrent write conflict on group {group_id} ({index_type}) after {attempts} attempts")]
    ConcurrencyConflict {
        group_id: i64,
        index_type: VectorType,
        attempts: u32,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl VectorError {
    /// Embedding timeouts are reported the same way as provider failures.
    #[inline]
    pub fn is_embedding_failure(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingFailed(_) | Self::EmbeddingTimeout { .. }
        )
    }
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod index;
pub mod indexer;
pub mod search;
pub mod service;
