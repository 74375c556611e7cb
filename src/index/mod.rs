// Similarity index module
// Exact flat index, its on-disk artifact format and the per-key engine

pub mod engine;
pub mod storage;


use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{Result, VectorError};

pub use engine::{IndexEngine, IndexKey};
pub use storage::IndexStorageError;

/// Distance used to rank neighbors. Smaller is closer for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Squared Euclidean distance
    #[default]
    L2,
    /// `1 - cosine similarity`
    Cosine,
}

impl DistanceMetric {
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
            DistanceMetric::Cosine => {
                let norm_a = l2_norm(a);
                let norm_b = l2_norm(b);
                if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
                    return 1.0;
                }
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                1.0 - dot / (norm_a * norm_b)
            }
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            DistanceMetric::L2 => 0,
            DistanceMetric::Cosine => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DistanceMetric::L2),
            1 => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            DistanceMetric::L2 => write!(f, "l2"),
            DistanceMetric::Cosine => write!(f, "cosine"),
        }
    }
}

#[inline]
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// One search result: a position in the index and its distance to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Dense, append-only vector store searched by brute force.
///
/// Vectors live contiguously in one buffer; the position of a vector is the
/// order in which it was appended.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    data: Vec<f32>,
}

impl FlatIndex {
    #[inline]
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            data: Vec::new(),
        }
    }

    /// Builds an index over an existing buffer whose length is a multiple of
    /// `dimension`.
    pub(crate) fn from_raw(dimension: usize, metric: DistanceMetric, data: Vec<f32>) -> Self {
        debug_assert!(dimension > 0 && data.len() % dimension == 0);
        Self {
            dimension,
            metric,
            data,
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn raw(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Appends a vector and returns its position
    #[inline]
    pub fn append(&mut self, vector: &[f32]) -> Result<usize> {
        self.check(vector)?;
        let position = self.len();
        self.data.extend_from_slice(vector);
        Ok(position)
    }

    /// Drops every vector at or after `len`
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len.saturating_mul(self.dimension));
    }

    /// Exact k nearest neighbors, closest first. Equal distances are ordered
    /// by ascending position.
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.check(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: self.metric.distance(query, vector),
            })
            .collect();

        let by_rank = |a: &Neighbor, b: &Neighbor| -> Ordering {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        };

        if k < neighbors.len() {
            neighbors.select_nth_unstable_by(k - 1, by_rank);
            neighbors.truncate(k);
        }
        neighbors.sort_unstable_by(by_rank);

        Ok(neighbors)
    }

    fn check(&self, vector: &[f32]) -> Result<()> {
        if vector.len() == self.dimension {
            Ok(())
        } else {
            Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            })
        }
    }
}
