// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Retrieval engine
//!
//! Ingestion splits a document into overlapping chunks, embeds each chunk
//! (embedding cache first, keyed by chunk text and model), and inserts the
//! vectors into the shared index. Every chunk gets a process-wide sequence
//! number at ingestion; that number is both its index id and its tie-break
//! rank.
//!
//! Embedding happens before any lock is taken. The index itself sits behind a
//! read/write lock, so concurrent queries never wait on each other and an
//! ingestion only blocks readers for the final swap-in. Ingestions of the same
//! document id are serialized.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::chunker::TextChunker;
use super::embedder::{cosine_similarity, EmbeddingProvider};
use super::index::VectorIndex;
use crate::cache::{CacheKey, CachedValue, ResponseCache};
use crate::errors::{EngineError, EngineResult};

/// Which documents a query may draw from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "scope", content = "documents")]
pub enum DocumentScope {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl DocumentScope {
    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DocumentScope::Only(ids.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, document_id: &str) -> bool {
        match self {
            DocumentScope::All => true,
            DocumentScope::Only(ids) => ids.contains(document_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentChunk {
    /// Ingestion sequence number, unique across the engine
    pub id: u64,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Arc<DocumentChunk>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentInfo {
    pub document_id: String,
    pub chunk_count: usize,
    /// SHA-256 of the raw text
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievalStats {
    pub documents: usize,
    pub chunks: usize,
    pub dimension: usize,
    pub index: &'static str,
    pub embedding_model: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedDocument {
    info: DocumentInfo,
    chunks: Vec<DocumentChunk>,
}

struct IndexState {
    index: Box<dyn VectorIndex>,
    chunks: HashMap<u64, Arc<DocumentChunk>>,
    documents: HashMap<String, (DocumentInfo, Vec<u64>)>,
}

pub struct RetrievalEngine {
    chunker: TextChunker,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<ResponseCache>,
    state: RwLock<IndexState>,
    next_id: AtomicU64,
    document_locks: DashMap<String, Arc<Mutex<()>>>,
    store_dir: Option<PathBuf>,
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

impl RetrievalEngine {
    pub fn new(
        chunker: TextChunker,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Box<dyn VectorIndex>,
        cache: Arc<ResponseCache>,
    ) -> EngineResult<Self> {
        if index.dimension() != embedder.dimension() {
            return Err(EngineError::Config(format!(
                "index dimension {} does not match embedding dimension {}",
                index.dimension(),
                embedder.dimension()
            )));
        }
        Ok(Self {
            chunker,
            embedder,
            cache,
            state: RwLock::new(IndexState {
                index,
                chunks: HashMap::new(),
                documents: HashMap::new(),
            }),
            next_id: AtomicU64::new(0),
            document_locks: DashMap::new(),
            store_dir: None,
        })
    }

    /// Persist each document under `dir` and reload what is already there
    pub async fn with_store(mut self, dir: impl AsRef<Path>) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        self.store_dir = Some(dir);
        self.load().await?;
        Ok(self)
    }

    /// Serializes ingestion and removal of one document id
    fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.document_locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Split, embed and index `raw_text` under `document_id`
    ///
    /// Re-ingesting an id replaces its previous chunk set. Identical text is a
    /// no-op that returns the existing chunk count.
    pub async fn ingest(&self, document_id: &str, raw_text: &str) -> EngineResult<usize> {
        if document_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("document id must not be empty".into()));
        }

        let lock = self.document_lock(document_id);
        let _guard = lock.lock().await;

        let hash = content_hash(raw_text);
        {
            let state = self.state.read().await;
            if let Some((info, _)) = state.documents.get(document_id) {
                if info.content_hash == hash {
                    debug!("Document {} unchanged, skipping ingestion", document_id);
                    return Ok(info.chunk_count);
                }
            }
        }

        let spans = self.chunker.chunk(raw_text);
        if spans.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "document {} contains no text",
                document_id
            )));
        }

        let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
        let embeddings = self.embed_cached(&texts).await?;

        let chunks: Vec<Arc<DocumentChunk>> = spans
            .into_iter()
            .zip(embeddings)
            .map(|(span, embedding)| {
                Arc::new(DocumentChunk {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    document_id: document_id.to_string(),
                    ordinal: span.ordinal,
                    text: span.text,
                    embedding,
                })
            })
            .collect();

        let info = DocumentInfo {
            document_id: document_id.to_string(),
            chunk_count: chunks.len(),
            content_hash: hash,
            ingested_at: Utc::now(),
        };

        {
            let mut state = self.state.write().await;
            Self::detach(&mut state, document_id);
            Self::attach(&mut state, info.clone(), &chunks)?;
        }

        self.persist_document(&info, &chunks).await?;
        info!(
            "Ingested document {} into {} chunks",
            document_id, info.chunk_count
        );
        Ok(info.chunk_count)
    }

    /// Top-`k` chunks from `scope` most similar to `query_text`
    pub async fn query(
        &self,
        scope: &DocumentScope,
        query_text: &str,
        k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let mut vectors = self.embed_cached(&[query_text.to_string()]).await?;
        let query = vectors
            .pop()
            .ok_or_else(|| EngineError::RetrievalUnavailable("query embedding failed".into()))?;
        self.query_by_vector(scope, &query, k).await
    }

    /// Ordered by score descending, ties by ingestion order
    pub async fn query_by_vector(
        &self,
        scope: &DocumentScope,
        query: &[f32],
        k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let state = self.state.read().await;

        let in_scope: usize = state
            .documents
            .iter()
            .filter(|(id, _)| scope.contains(id))
            .map(|(_, (info, _))| info.chunk_count)
            .sum();
        if in_scope == 0 {
            return Err(EngineError::RetrievalUnavailable(match scope {
                DocumentScope::All => "no documents have been ingested".to_string(),
                DocumentScope::Only(ids) => format!(
                    "no indexed chunks for documents [{}]",
                    ids.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            }));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let total = state.index.len();
        let mut fetch = k.min(total);
        let mut candidates: Vec<Arc<DocumentChunk>>;
        loop {
            candidates = state
                .index
                .search(query, fetch)?
                .into_iter()
                .filter_map(|n| state.chunks.get(&n.id))
                .filter(|chunk| scope.contains(&chunk.document_id))
                .cloned()
                .collect();
            if candidates.len() >= k.min(in_scope) || fetch >= total {
                break;
            }
            fetch = (fetch * 2).min(total);
        }

        let mut results: Vec<RetrievedChunk> = candidates
            .into_iter()
            .map(|chunk| RetrievedChunk {
                score: cosine_similarity(query, &chunk.embedding),
                chunk,
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        results.truncate(k);
        Ok(results)
    }

    pub async fn remove_document(&self, document_id: &str) -> EngineResult<bool> {
        let lock = self.document_lock(document_id);
        let _guard = lock.lock().await;

        let removed = {
            let mut state = self.state.write().await;
            Self::detach(&mut state, document_id)
        };
        if removed {
            if let Some(path) = self.document_path(document_id) {
                if fs::try_exists(&path).await.unwrap_or(false) {
                    fs::remove_file(&path).await?;
                }
            }
            info!("Removed document {}", document_id);
        }
        Ok(removed)
    }

    pub async fn documents(&self) -> Vec<DocumentInfo> {
        let state = self.state.read().await;
        let mut docs: Vec<DocumentInfo> =
            state.documents.values().map(|(info, _)| info.clone()).collect();
        docs.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        docs
    }

    /// Chunks of one document in ordinal order
    pub async fn chunks(&self, document_id: &str) -> Vec<Arc<DocumentChunk>> {
        let state = self.state.read().await;
        state
            .documents
            .get(document_id)
            .map(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| state.chunks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> RetrievalStats {
        let state = self.state.read().await;
        RetrievalStats {
            documents: state.documents.len(),
            chunks: state.chunks.len(),
            dimension: state.index.dimension(),
            index: state.index.kind(),
            embedding_model: self.embedder.model_id().to_string(),
        }
    }

    /// Rewrite every document file
    pub async fn flush(&self) -> EngineResult<()> {
        if self.store_dir.is_none() {
            return Ok(());
        }
        let snapshot: Vec<(DocumentInfo, Vec<Arc<DocumentChunk>>)> = {
            let state = self.state.read().await;
            state
                .documents
                .values()
                .map(|(info, ids)| {
                    (
                        info.clone(),
                        ids.iter().filter_map(|id| state.chunks.get(id).cloned()).collect(),
                    )
                })
                .collect()
        };
        for (info, chunks) in &snapshot {
            self.persist_document(info, chunks).await?;
        }
        debug!("Flushed {} documents", snapshot.len());
        Ok(())
    }

    async fn embed_cached(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let model = self.embedder.model_id().to_string();
        let keys: Vec<CacheKey> = texts.iter().map(|t| CacheKey::embedding(t, &model)).collect();

        let mut vectors: Vec<Option<Vec<f32>>> =
            keys.iter().map(|key| self.cache.get_embedding(key)).collect();
        let missing: Vec<usize> = (0..texts.len()).filter(|i| vectors[*i].is_none()).collect();

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|i| texts[*i].clone()).collect();
            let computed = self.embedder.embed(&batch).await?;
            if computed.len() != batch.len() {
                return Err(EngineError::InvalidInput(format!(
                    "embedder returned {} vectors for {} texts",
                    computed.len(),
                    batch.len()
                )));
            }
            for (i, vector) in missing.iter().zip(computed) {
                self.cache
                    .put(keys[*i].clone(), CachedValue::Embedding(vector.clone()), None);
                vectors[*i] = Some(vector);
            }
            debug!(
                "Embedded {} of {} texts ({} from cache)",
                missing.len(),
                texts.len(),
                texts.len() - missing.len()
            );
        }

        Ok(vectors.into_iter().flatten().collect())
    }

    fn detach(state: &mut IndexState, document_id: &str) -> bool {
        match state.documents.remove(document_id) {
            Some((_, ids)) => {
                for id in ids {
                    state.index.remove(id);
                    state.chunks.remove(&id);
                }
                true
            }
            None => false,
        }
    }

    fn attach(
        state: &mut IndexState,
        info: DocumentInfo,
        chunks: &[Arc<DocumentChunk>],
    ) -> EngineResult<()> {
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if let Err(e) = state.index.insert(chunk.id, &chunk.embedding) {
                for id in &ids {
                    state.index.remove(*id);
                    state.chunks.remove(id);
                }
                return Err(e);
            }
            state.chunks.insert(chunk.id, Arc::clone(chunk));
            ids.push(chunk.id);
        }
        state
            .documents
            .insert(info.document_id.clone(), (info, ids));
        Ok(())
    }

    fn document_path(&self, document_id: &str) -> Option<PathBuf> {
        self.store_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", hex::encode(document_id.as_bytes()))))
    }

    async fn persist_document(
        &self,
        info: &DocumentInfo,
        chunks: &[Arc<DocumentChunk>],
    ) -> EngineResult<()> {
        let Some(path) = self.document_path(&info.document_id) else {
            return Ok(());
        };
        let doc = PersistedDocument {
            info: info.clone(),
            chunks: chunks.iter().map(|c| c.as_ref().clone()).collect(),
        };
        let json = serde_json::to_string(&doc)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn load(&self) -> EngineResult<()> {
        let Some(dir) = &self.store_dir else {
            return Ok(());
        };

        let mut documents = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<PersistedDocument>(&content) {
                Ok(doc) => documents.push(doc),
                Err(e) => warn!("Skipping unreadable index file {}: {}", path.display(), e),
            }
        }
        // Re-insert in original ingestion order
        documents.sort_by_key(|d| d.chunks.first().map(|c| c.id).unwrap_or(u64::MAX));

        let dimension = self.embedder.dimension();
        let mut max_id = None;
        let mut state = self.state.write().await;
        for doc in documents {
            if doc.chunks.iter().any(|c| c.embedding.len() != dimension) {
                warn!(
                    "Skipping document {}: stored embeddings do not match dimension {}",
                    doc.info.document_id, dimension
                );
                continue;
            }
            let chunks: Vec<Arc<DocumentChunk>> = doc.chunks.into_iter().map(Arc::new).collect();
            if let Some(last) = chunks.iter().map(|c| c.id).max() {
                max_id = max_id.max(Some(last));
            }
            let id = doc.info.document_id.clone();
            if let Err(e) = Self::attach(&mut state, doc.info, &chunks) {
                warn!("Skipping document {}: {}", id, e);
            }
        }
        if let Some(max_id) = max_id {
            self.next_id.store(max_id + 1, Ordering::SeqCst);
        }

        info!(
            "Loaded {} documents ({} chunks) from {}",
            state.documents.len(),
            state.chunks.len(),
            dir.display()
        );
        Ok(())
    }
}
