#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use crate::{RagError, Result};

/// Contiguous, exhaustively scanned inner-product store
///
/// Vectors are kept L2-normalized, so the inner product of two stored vectors is
/// their cosine similarity. Slots are assigned in insertion order and never reused;
/// the only way to drop vectors is to build a new store from the survivors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatStore {
    dimension: Option<usize>,
    data: Vec<f32>,
}

impl FlatStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from raw, already-normalized components
    #[inline]
    pub fn from_raw(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(RagError::IndexCorruption(format!(
                "{} components do not divide into {}-dimensional vectors",
                data.len(),
                dimension
            )));
        }
        Ok(Self {
            dimension: Some(dimension),
            data,
        })
    }

    #[inline]
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dimension.map_or(0, |dimension| self.data.len() / dimension)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn raw(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        let dimension = self.dimension?;
        self.data.get(slot * dimension..(slot + 1) * dimension)
    }

    /// Check that every vector matches the store's dimension (or each other, if the store is empty)
    #[inline]
    pub fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<()> {
        let Some(first) = vectors.first() else {
            return Ok(());
        };
        let expected = self.dimension.unwrap_or(first.len());
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }
        Ok(())
    }

    /// Normalize and append `vectors`, returning the first assigned slot
    ///
    /// Nothing is appended unless every vector is valid.
    #[inline]
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<usize> {
        self.check_dimensions(vectors)?;

        let normalized = vectors
            .iter()
            .map(|vector| {
                l2_normalize(vector).ok_or_else(|| {
                    RagError::InvalidRequest("cannot index a zero-length or zero vector".to_string())
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let first_slot = self.len();
        for vector in &normalized {
            self.push_normalized(vector);
        }
        Ok(first_slot)
    }

    /// Append a vector that is already unit length, as copied out of another store
    #[inline]
    pub fn push_normalized(&mut self, vector: &[f32]) {
        if self.dimension.is_none() {
            self.dimension = Some(vector.len());
        }
        self.data.extend_from_slice(vector);
    }

    /// Keep only the first `len` vectors
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        match self.dimension {
            Some(_) if len == 0 => *self = Self::default(),
            Some(dimension) => self.data.truncate(len * dimension),
            None => {}
        }
    }

    /// Top `k` slots by inner product with a normalized query, ties broken by slot
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let Some(dimension) = self.dimension else {
            return Vec::new();
        };
        if k == 0 || query.len() != dimension {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(dimension)
            .map(|vector| dot(vector, query))
            .enumerate()
            .collect();

        let by_rank = |a: &(usize, f32), b: &(usize, f32)| -> Ordering {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
        };
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_rank);
        scored
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Unit-length copy of `vector`, or `None` for empty, zero or non-finite input
#[inline]
pub fn l2_normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = dot(vector, vector).sqrt();
    if vector.is_empty() || norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}
