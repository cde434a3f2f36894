// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Embedding providers
//!
//! The retrieval engine only depends on [`EmbeddingProvider`]. Two
//! implementations ship with the engine:
//!
//! - [`HashingEmbedder`]: deterministic feature hashing of word tokens and
//!   character trigrams, needs no model files or network
//! - [`RemoteEmbedder`]: any OpenAI-compatible `/embeddings` endpoint

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifies the model; part of every embedding cache key
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Embed a batch; output order matches input order
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;
}

/// Scale a vector to unit length; zero vectors are returned unchanged
pub fn normalize(vector: &mut [f32]) {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 && magnitude.is_finite() {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Cosine similarity of two equal-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Deterministic bag-of-features embedder
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model_id: format!("hashing-{}", dimension.max(1)),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut vector = vec![0.0f32; self.dimension];

        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            self.add_feature(&mut vector, "w", token, 1.0);
        }

        let chars: Vec<char> = lowered.chars().filter(|c| !c.is_whitespace()).collect();
        if chars.len() < 3 {
            let all: String = chars.iter().collect();
            if !all.is_empty() {
                self.add_feature(&mut vector, "g", &all, 0.5);
            }
        } else {
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, "g", &gram, 0.5);
            }
        }

        normalize(&mut vector);
        vector
    }

    fn add_feature(&self, vector: &mut [f32], namespace: &str, feature: &str, weight: f32) {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();

        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Client for an OpenAI-compatible embeddings endpoint
pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(endpoint: &str, model: &str, dimension: usize) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::Config(format!("embedding client: {}", e)))?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        info!(
            "Remote embedder configured: endpoint={}, model={}",
            endpoint, model
        );

        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            dimension,
        })
    }

    fn unavailable(&self, reason: impl ToString) -> EngineError {
        EngineError::BackendUnavailable {
            backend: format!("embeddings:{}", self.model),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("HTTP {}", response.status())));
        }

        let mut body: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| EngineError::BackendInvalidResponse {
                    backend: format!("embeddings:{}", self.model),
                    reason: e.to_string(),
                })?;

        if body.data.len() != texts.len() {
            return Err(EngineError::BackendInvalidResponse {
                backend: format!("embeddings:{}", self.model),
                reason: format!("expected {} embeddings, got {}", texts.len(), body.data.len()),
            });
        }

        body.data.sort_by_key(|d| d.index);
        let mut vectors = Vec::with_capacity(body.data.len());
        for item in body.data {
            if item.embedding.len() != self.dimension {
                return Err(EngineError::BackendInvalidResponse {
                    backend: format!("embeddings:{}", self.model),
                    reason: format!(
                        "expected dimension {}, got {}",
                        self.dimension,
                        item.embedding.len()
                    ),
                });
            }
            vectors.push(item.embedding);
        }
        debug!("Embedded {} texts remotely", vectors.len());
        Ok(vectors)
    }
}
