// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Nearest-neighbour indexes
//!
//! The retrieval engine talks to an index only through [`VectorIndex`]:
//! insert a vector under a numeric id, remove it, and ask for the `k` ids
//! most similar to a query. Both implementations use cosine similarity.
//!
//! - [`FlatIndex`]: exact brute-force scan, deterministic tie order
//! - [`HnswVectorIndex`]: approximate search over `hnsw_rs`, with tombstones
//!   for removal since the graph itself is append-only

use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::prelude::*;
use std::collections::{HashMap, HashSet};

use super::embedder::normalize;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    /// Cosine similarity
    pub score: f32,
}

pub trait VectorIndex: Send + Sync {
    fn insert(&mut self, id: u64, vector: &[f32]) -> EngineResult<()>;

    fn remove(&mut self, id: u64) -> bool;

    /// Up to `k` ids ordered by descending similarity. A zero query has no
    /// direction and matches nothing.
    fn search(&self, query: &[f32], k: usize) -> EngineResult<Vec<Neighbor>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;

    fn kind(&self) -> &'static str;
}

fn is_zero(vector: &[f32]) -> bool {
    vector.iter().all(|v| *v == 0.0)
}

fn validate(vector: &[f32], dimension: usize, what: &str) -> EngineResult<Vec<f32>> {
    if vector.len() != dimension {
        return Err(EngineError::InvalidInput(format!(
            "{} has wrong dimensions: expected {}, got {}",
            what,
            dimension,
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::InvalidInput(format!(
            "{} contains NaN or Infinity values",
            what
        )));
    }
    if is_zero(vector) {
        return Err(EngineError::InvalidInput(format!("{} is a zero vector", what)));
    }
    let mut normalized = vector.to_vec();
    normalize(&mut normalized);
    Ok(normalized)
}

fn rank(results: &mut Vec<Neighbor>, k: usize) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    results.truncate(k);
}

/// Exact cosine search over every stored vector
pub struct FlatIndex {
    dimension: usize,
    vectors: HashMap<u64, Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&mut self, id: u64, vector: &[f32]) -> EngineResult<()> {
        let normalized = validate(vector, self.dimension, "Vector")?;
        self.vectors.insert(id, normalized);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> bool {
        self.vectors.remove(&id).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> EngineResult<Vec<Neighbor>> {
        if query.len() == self.dimension && is_zero(query) {
            return Ok(Vec::new());
        }
        let query = validate(query, self.dimension, "Query")?;
        let mut results: Vec<Neighbor> = self
            .vectors
            .iter()
            .map(|(id, v)| Neighbor {
                id: *id,
                score: v.iter().zip(&query).map(|(a, b)| a * b).sum(),
            })
            .collect();
        rank(&mut results, k);
        Ok(results)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn kind(&self) -> &'static str {
        "flat"
    }
}

/// Approximate cosine search backed by an HNSW graph
pub struct HnswVectorIndex {
    hnsw: Hnsw<'static, f32, DistCosine>,
    dimension: usize,
    live: HashSet<u64>,
    tombstones: HashSet<u64>,
}

impl HnswVectorIndex {
    /// Graph parameters sized for a few hundred thousand chunks
    pub fn new(dimension: usize, expected_elements: usize) -> Self {
        let max_nb_connection = 16;
        let ef_construction = 200;
        let nb_layer = 16;
        Self {
            hnsw: Hnsw::new(
                max_nb_connection,
                expected_elements.max(1_000),
                nb_layer,
                ef_construction,
                DistCosine,
            ),
            dimension,
            live: HashSet::new(),
            tombstones: HashSet::new(),
        }
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones.len()
    }
}

impl VectorIndex for HnswVectorIndex {
    fn insert(&mut self, id: u64, vector: &[f32]) -> EngineResult<()> {
        let normalized = validate(vector, self.dimension, "Vector")?;
        if self.live.contains(&id) || self.tombstones.contains(&id) {
            // Graph points cannot be replaced in place
            return Err(EngineError::InvalidInput(format!(
                "vector id {} already used",
                id
            )));
        }
        self.hnsw.insert((normalized.as_slice(), id as usize));
        self.live.insert(id);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> bool {
        if self.live.remove(&id) {
            self.tombstones.insert(id);
            true
        } else {
            false
        }
    }

    fn search(&self, query: &[f32], k: usize) -> EngineResult<Vec<Neighbor>> {
        if query.len() == self.dimension && is_zero(query) {
            return Ok(Vec::new());
        }
        let query = validate(query, self.dimension, "Query")?;
        if self.live.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // Over-fetch so tombstoned points do not starve the result
        let fetch = (k + self.tombstones.len()).min(self.live.len() + self.tombstones.len());
        let ef_search = (fetch * 2).max(50);
        let neighbours: Vec<Neighbour> = self.hnsw.search(&query, fetch, ef_search);

        let mut results: Vec<Neighbor> = neighbours
            .into_iter()
            .map(|n| (n.d_id as u64, n.distance))
            .filter(|(id, _)| self.live.contains(id))
            .map(|(id, distance)| Neighbor {
                id,
                score: 1.0 - distance,
            })
            .collect();
        rank(&mut results, k);
        Ok(results)
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn kind(&self) -> &'static str {
        "hnsw"
    }
}
