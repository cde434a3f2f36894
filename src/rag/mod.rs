// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// RAG (Retrieval-Augmented Generation) module
// Document chunking, embedding and similarity search shared by all sessions

pub mod chunker;
pub mod embedder;
pub mod index;
pub mod retrieval;

use std::sync::Arc;

pub use chunker::{TextChunker, TextSpan};
pub use embedder::{cosine_similarity, EmbeddingProvider, HashingEmbedder, RemoteEmbedder};
pub use index::{FlatIndex, HnswVectorIndex, Neighbor, VectorIndex};
pub use retrieval::{
    DocumentChunk, DocumentInfo, DocumentScope, RetrievalEngine, RetrievalStats, RetrievedChunk,
};

use crate::config::{IndexKind, RetrievalConfig};
use crate::errors::EngineResult;

/// Embedding provider selected by configuration
pub fn embedder_from_config(config: &RetrievalConfig) -> EngineResult<Arc<dyn EmbeddingProvider>> {
    match &config.embedding_endpoint {
        Some(endpoint) => {
            let model = config
                .embedding_model
                .as_deref()
                .unwrap_or("text-embedding-3-small");
            Ok(Arc::new(RemoteEmbedder::new(
                endpoint,
                model,
                config.embedding_dimension,
            )?))
        }
        None => Ok(Arc::new(HashingEmbedder::new(config.embedding_dimension))),
    }
}

/// Vector index selected by configuration
pub fn index_from_config(config: &RetrievalConfig) -> Box<dyn VectorIndex> {
    match config.index {
        IndexKind::Flat => Box::new(FlatIndex::new(config.embedding_dimension)),
        IndexKind::Hnsw => Box::new(HnswVectorIndex::new(config.embedding_dimension, 10_000)),
    }
}
