// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use fabstir_rag_engine::cache::ResponseCache;
use fabstir_rag_engine::config::CacheConfig;
use fabstir_rag_engine::rag::{FlatIndex, HashingEmbedder, TextChunker};
use fabstir_rag_engine::{DocumentScope, RetrievalEngine};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const DIM: usize = 64;

// Three 12-character runs with no whitespace split cleanly into three chunks
const THREE_PARTS: &str = "aaaaaaaaaaaabbbbbbbbbbbbcccccccccccc";

fn engine() -> RetrievalEngine {
    RetrievalEngine::new(
        TextChunker::new(12, 0).unwrap(),
        Arc::new(HashingEmbedder::new(DIM)),
        Box::new(FlatIndex::new(DIM)),
        Arc::new(ResponseCache::new(&CacheConfig::default())),
    )
    .unwrap()
}

async fn persistent_engine(dir: &Path) -> RetrievalEngine {
    engine().with_store(dir).await.unwrap()
}

#[tokio::test]
async fn test_query_matching_second_chunk_ranks_it_first() {
    let engine = engine();
    assert_eq!(engine.ingest("doc", THREE_PARTS).await.unwrap(), 3);

    let chunks = engine.chunks("doc").await;
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[1].text, "bbbbbbbbbbbb");

    let results = engine
        .query_by_vector(&DocumentScope::All, &chunks[1].embedding, 3)
        .await
        .unwrap();
    assert_eq!(results[0].chunk.id, chunks[1].id);
    assert!((results[0].score - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn test_text_query_matching_second_chunk_ranks_it_first() {
    let engine = engine();
    engine.ingest("doc", THREE_PARTS).await.unwrap();

    let results = engine
        .query(&DocumentScope::All, "bbbbbbbbbbbb", 1)
        .await
        .unwrap();
    assert_eq!(results[0].chunk.ordinal, 1);
}

#[tokio::test]
async fn test_reingesting_same_text_is_idempotent() {
    let engine = engine();
    engine.ingest("doc", THREE_PARTS).await.unwrap();
    let before: Vec<u64> = engine.chunks("doc").await.iter().map(|c| c.id).collect();

    assert_eq!(engine.ingest("doc", THREE_PARTS).await.unwrap(), 3);
    let after: Vec<u64> = engine.chunks("doc").await.iter().map(|c| c.id).collect();

    assert_eq!(before, after);
    assert_eq!(engine.stats().await.chunks, 3);
}

#[tokio::test]
async fn test_reingesting_changed_text_replaces_chunks() {
    let engine = engine();
    engine.ingest("doc", THREE_PARTS).await.unwrap();
    assert_eq!(engine.ingest("doc", "dddddddddddd").await.unwrap(), 1);

    let stats = engine.stats().await;
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.chunks, 1);

    let results = engine
        .query(&DocumentScope::All, "aaaaaaaaaaaa", 5)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.text, "dddddddddddd");
}

#[tokio::test]
async fn test_empty_document_is_rejected() {
    let engine = engine();
    assert!(engine.ingest("blank", "   \n ").await.is_err());
    assert!(engine.ingest("", "text").await.is_err());
    assert_eq!(engine.stats().await.documents, 0);
}

#[tokio::test]
async fn test_index_reloads_from_store() {
    let dir = TempDir::new().unwrap();
    {
        let engine = persistent_engine(dir.path()).await;
        engine.ingest("doc", THREE_PARTS).await.unwrap();
        engine.ingest("other", "zzzzzzzzzzzz").await.unwrap();
        assert!(engine.remove_document("other").await.unwrap());
        engine.flush().await.unwrap();
    }

    let engine = persistent_engine(dir.path()).await;
    let docs = engine.documents().await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].document_id, "doc");
    assert_eq!(docs[0].chunk_count, 3);

    let results = engine
        .query(&DocumentScope::All, "cccccccccccc", 1)
        .await
        .unwrap();
    assert_eq!(results[0].chunk.ordinal, 2);

    // New chunks never reuse restored ids
    engine.ingest("fresh", "eeeeeeeeeeee").await.unwrap();
    let restored_max = engine.chunks("doc").await.iter().map(|c| c.id).max().unwrap();
    let fresh = engine.chunks("fresh").await;
    assert!(fresh[0].id > restored_max);
}

#[tokio::test]
async fn test_removal_racing_ingestion_matches_store() {
    let dir = TempDir::new().unwrap();
    let engine = persistent_engine(dir.path()).await;

    for round in 0..25 {
        let text = format!("round {} {}", round, "q".repeat(30));
        let (ingested, removed) = tokio::join!(
            engine.ingest("doc", &text),
            engine.remove_document("doc")
        );
        ingested.unwrap();
        removed.unwrap();

        // Whatever order the two ran in, a reload sees the same documents
        let in_memory: Vec<String> = engine.documents().await.into_iter().map(|d| d.document_id).collect();
        let reloaded = persistent_engine(dir.path()).await;
        let on_disk: Vec<String> = reloaded.documents().await.into_iter().map(|d| d.document_id).collect();
        assert_eq!(in_memory, on_disk, "round {}", round);
    }
}
