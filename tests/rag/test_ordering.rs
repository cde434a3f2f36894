// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use fabstir_rag_engine::cache::ResponseCache;
use fabstir_rag_engine::config::CacheConfig;
use fabstir_rag_engine::rag::{EmbeddingProvider, FlatIndex, HnswVectorIndex, TextChunker, VectorIndex};
use fabstir_rag_engine::{DocumentScope, EngineError, EngineResult, RetrievalEngine};
use std::sync::Arc;

/// Two-dimensional embeddings whose cosine with [1, 0] is known up front
struct FixedEmbedder;

fn at_similarity(score: f32) -> Vec<f32> {
    vec![score, (1.0 - score * score).sqrt()]
}

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    fn model_id(&self) -> &str {
        "fixed-2"
    }

    fn dimension(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| match t.as_str() {
                "ninety" => at_similarity(0.9),
                "seventy" => at_similarity(0.7),
                "ninety-five" => at_similarity(0.95),
                "twin" => at_similarity(0.8),
                _ => vec![1.0, 0.0],
            })
            .collect())
    }
}

fn engine(index: Box<dyn VectorIndex>) -> RetrievalEngine {
    RetrievalEngine::new(
        TextChunker::new(100, 10).unwrap(),
        Arc::new(FixedEmbedder),
        index,
        Arc::new(ResponseCache::new(&CacheConfig::default())),
    )
    .unwrap()
}

async fn seeded(index: Box<dyn VectorIndex>) -> RetrievalEngine {
    let engine = engine(index);
    engine.ingest("a", "ninety").await.unwrap();
    engine.ingest("b", "seventy").await.unwrap();
    engine.ingest("c", "ninety-five").await.unwrap();
    engine
}

#[tokio::test]
async fn test_top_two_in_descending_order() {
    let engine = seeded(Box::new(FlatIndex::new(2))).await;

    let results = engine
        .query_by_vector(&DocumentScope::All, &[1.0, 0.0], 2)
        .await
        .unwrap();

    let docs: Vec<&str> = results.iter().map(|r| r.chunk.document_id.as_str()).collect();
    assert_eq!(docs, vec!["c", "a"]);
    assert!((results[0].score - 0.95).abs() < 1e-4);
    assert!((results[1].score - 0.9).abs() < 1e-4);
}

#[tokio::test]
async fn test_hnsw_index_gives_same_ordering() {
    let engine = seeded(Box::new(HnswVectorIndex::new(2, 16))).await;

    let results = engine
        .query_by_vector(&DocumentScope::All, &[1.0, 0.0], 3)
        .await
        .unwrap();

    let docs: Vec<&str> = results.iter().map(|r| r.chunk.document_id.as_str()).collect();
    assert_eq!(docs, vec!["c", "a", "b"]);
}

#[tokio::test]
async fn test_equal_scores_rank_earlier_ingestion_first() {
    let engine = engine(Box::new(FlatIndex::new(2)));
    engine.ingest("late-alphabet-first", "twin").await.unwrap();
    engine.ingest("another", "twin").await.unwrap();

    let results = engine
        .query_by_vector(&DocumentScope::All, &[1.0, 0.0], 2)
        .await
        .unwrap();

    assert_eq!(results[0].chunk.document_id, "late-alphabet-first");
    assert_eq!(results[1].chunk.document_id, "another");
    assert!(results[0].chunk.id < results[1].chunk.id);
}

#[tokio::test]
async fn test_scope_excludes_higher_scoring_documents() {
    let engine = seeded(Box::new(FlatIndex::new(2))).await;

    let results = engine
        .query_by_vector(&DocumentScope::only(["b"]), &[1.0, 0.0], 2)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.document_id, "b");
}

#[tokio::test]
async fn test_empty_document_set_is_retrieval_unavailable() {
    let engine = seeded(Box::new(FlatIndex::new(2))).await;

    let err = engine
        .query(&DocumentScope::only(["missing"]), "anything", 3)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RetrievalUnavailable(_)));
    assert!(err.is_recoverable());
}
