//! Exact (flat) similarity index over paragraph embeddings
//!
//! Row `i` of the index always corresponds to paragraph `i` of the corpus it was
//! built from. The metric decides both ranking and normalization:
//!
//! - [`Metric::InnerProduct`] L2-normalizes every stored row and every query,
//!   so scores are cosine similarities in `[-1, 1]`, highest first.
//! - [`Metric::Euclidean`] stores raw vectors and scores by L2 distance,
//!   lowest first.

pub mod storage;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::embeddings::Embedding;
use crate::{RagError, Result};

pub use storage::{BuildLock, IndexManifest, IndexStore, LoadedIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    InnerProduct,
    Euclidean,
}

impl Metric {
    /// Whether vectors are unit-normalized before they are stored or queried
    #[inline]
    pub fn normalizes(self) -> bool {
        matches!(self, Self::InnerProduct)
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::InnerProduct => 0,
            Self::Euclidean => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::InnerProduct),
            1 => Some(Self::Euclidean),
            _ => None,
        }
    }

    /// Ordering that puts the better of two scores first
    fn rank(self, a: f32, b: f32) -> Ordering {
        match self {
            Self::InnerProduct => b.total_cmp(&a),
            Self::Euclidean => a.total_cmp(&b),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InnerProduct => f.write_str("inner_product"),
            Self::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for Metric {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner_product" | "ip" | "cosine" => Ok(Self::InnerProduct),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(RagError::Config(format!("unknown metric: {other}"))),
        }
    }
}

/// One search result: a paragraph id and its score under the index metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: usize,
    /// Cosine similarity for inner product, L2 distance for Euclidean
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    metric: Metric,
    dimension: usize,
    /// Row-major, `len() * dimension` values
    vectors: Vec<f32>,
}

impl FlatIndex {
    /// Build an index over all rows. The dimension is taken from the first row
    /// and every other row must match it.
    pub fn build(embeddings: &[Embedding], metric: Metric) -> Result<Self> {
        let dimension = embeddings
            .first()
            .map(Vec::len)
            .ok_or_else(|| RagError::Index("cannot build an index from zero embeddings".into()))?;

        if dimension == 0 {
            return Err(RagError::Index("embeddings have zero dimensions".into()));
        }

        let mut vectors = Vec::with_capacity(embeddings.len() * dimension);
        for (row, embedding) in embeddings.iter().enumerate() {
            if embedding.len() != dimension {
                return Err(RagError::Index(format!(
                    "inconsistent embedding dimension at row {row}: expected {dimension}, got {}",
                    embedding.len()
                )));
            }

            let start = vectors.len();
            vectors.extend_from_slice(embedding);
            if metric.normalizes() {
                l2_normalize(&mut vectors[start..]);
            }
        }

        Ok(Self {
            metric,
            dimension,
            vectors,
        })
    }

    pub(crate) fn from_parts(metric: Metric, dimension: usize, vectors: Vec<f32>) -> Self {
        debug_assert!(dimension > 0 && vectors.len() % dimension == 0);
        Self {
            metric,
            dimension,
            vectors,
        }
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vectors.len() / self.dimension
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub(crate) fn raw_vectors(&self) -> &[f32] {
        &self.vectors
    }

    /// Return at most `k` hits, best first. Ties go to the lower paragraph id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(RagError::Index(format!(
                "query has {} dimensions but the index has {}",
                query.len(),
                self.dimension
            )));
        }

        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        if self.metric.normalizes() {
            l2_normalize(&mut query);
        }

        let mut hits: Vec<SearchHit> = self
            .vectors
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(id, row)| SearchHit {
                id,
                score: self.score(&query, row),
            })
            .collect();

        hits.sort_by(|a, b| {
            self.metric
                .rank(a.score, b.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);

        Ok(hits)
    }

    fn score(&self, query: &[f32], row: &[f32]) -> f32 {
        match self.metric {
            Metric::InnerProduct => dot(query, row).clamp(-1.0, 1.0),
            Metric::Euclidean => query
                .iter()
                .zip(row)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = dot(vector, vector).sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
