// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shared fixtures for engine-level tests

use async_trait::async_trait;
use fabstir_rag_engine::config::EngineConfig;
use fabstir_rag_engine::gateway::{AssembledPrompt, BackendError, BackendKind, ModelBackend};
use fabstir_rag_engine::EngineContext;
use secrecy::SecretString;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Local backend that answers with a fixed reply or error
pub struct ScriptedBackend {
    name: String,
    reply: Result<String, BackendError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<AssembledPrompt>>,
}

impl ScriptedBackend {
    pub fn replying(name: &str, reply: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: Ok(reply.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: Err(BackendError::unavailable(name, "connection refused")),
            delay: None,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: Ok("too late".to_string()),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<AssembledPrompt> {
        self.last_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn is_local(&self) -> bool {
        true
    }

    fn context_window(&self) -> usize {
        4096
    }

    fn max_response_tokens(&self) -> usize {
        512
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        prompt: &AssembledPrompt,
        _max_tokens: usize,
        _credential: Option<&SecretString>,
    ) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone()
    }
}

/// Defaults rooted in `data_dir`, with a short request timeout
pub fn test_config(data_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.gateway.request_timeout_secs = 1;
    config.retrieval.chunk_size = 120;
    config.retrieval.chunk_overlap = 20;
    config.retrieval.embedding_dimension = 128;
    config
}

pub async fn engine_with(config: EngineConfig, backend: Arc<ScriptedBackend>) -> EngineContext {
    let backend: Arc<dyn ModelBackend> = backend;
    EngineContext::initialize_with_backends(config, vec![(backend, None)])
        .await
        .unwrap()
}
