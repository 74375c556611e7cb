// Embeddings module
// Provider abstraction plus the Ollama-backed implementation

pub mod ollama;

use async_trait::async_trait;

use crate::{Result, VectorError};

pub use ollama::{DEFAULT_EMBEDDING_DIMENSION, OllamaClient};

/// Maps text to fixed-length vectors. Implementations report every failure
/// as [`VectorError::EmbeddingFailed`] so callers can treat them uniformly.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Length of every vector this provider returns
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds all texts, preserving input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// Round-trips a trivial embedding and checks its length
    async fn probe(&self) -> Result<()> {
        let embedding = self.embed("health check").await?;
        check_dimension(self.dimension(), &embedding)
    }
}

#[inline]
pub fn check_dimension(expected: usize, embedding: &[f32]) -> Result<()> {
    if embedding.len() == expected {
        Ok(())
    } else {
        Err(VectorError::DimensionMismatch {
            expected,
            got: embedding.len(),
        })
    }
}
