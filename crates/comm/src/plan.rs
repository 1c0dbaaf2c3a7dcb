//! Chunk planning along one dimension
//!
//! Splits an extent across N destinations, either as evenly as possible or
//! with caller-supplied sizes. Even splits hand the remainder to the earliest
//! chunks, one element each.

use serde::{Deserialize, Serialize};
use xstream_core::{Error, Result};

/// One destination's share of the split dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: usize,
    pub extent: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub dim: usize,
    pub total: usize,
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    /// Split `total` into `parts` chunks whose extents differ by at most one
    pub fn even(dim: usize, total: usize, parts: usize) -> Result<Self> {
        if parts == 0 {
            return Err(Error::invalid_config("ChunkPlan::even", "need at least one chunk"));
        }
        let base = total / parts;
        let remainder = total % parts;
        let extents: Vec<usize> = (0..parts)
            .map(|i| base + usize::from(i < remainder))
            .collect();
        Ok(Self::from_extents(dim, total, &extents))
    }

    /// Use explicit extents, which must sum to `total`. Zero extents are allowed.
    pub fn explicit(dim: usize, total: usize, extents: &[usize]) -> Result<Self> {
        let op = "ChunkPlan::explicit";
        if extents.is_empty() {
            return Err(Error::invalid_config(op, "need at least one chunk"));
        }
        let sum: usize = extents.iter().sum();
        if sum != total {
            return Err(Error::shape_mismatch(
                op,
                format!(
                    "chunk sizes {:?} sum to {}, dim {} has extent {}",
                    extents, sum, dim, total
                ),
            ));
        }
        Ok(Self::from_extents(dim, total, extents))
    }

    fn from_extents(dim: usize, total: usize, extents: &[usize]) -> Self {
        let mut offset = 0;
        let chunks = extents
            .iter()
            .map(|&extent| {
                let chunk = Chunk { offset, extent };
                offset += extent;
                chunk
            })
            .collect();
        Self { dim, total, chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn extents(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.extent).collect()
    }

    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .chunks
            .iter()
            .map(|c| format!("{}..{}", c.offset, c.offset + c.extent))
            .collect();
        format!("dim {} extent {} -> [{}]", self.dim, self.total, parts.join(", "))
    }
}
