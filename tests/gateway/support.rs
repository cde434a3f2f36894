// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use fabstir_rag_engine::cache::ResponseCache;
use fabstir_rag_engine::config::{CacheConfig, GatewayConfig};
use fabstir_rag_engine::crypto::CredentialVault;
use fabstir_rag_engine::gateway::{AssembledPrompt, BackendError, BackendKind, ModelBackend};
use fabstir_rag_engine::ModelGateway;
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const VAULT_KEY: [u8; 32] = [7u8; 32];

pub struct MockBackend {
    name: String,
    local: bool,
    reachable: bool,
    reply: Result<String, BackendError>,
    calls: AtomicUsize,
    seen_credential: Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new(name: &str, local: bool, reply: Result<&str, BackendError>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            local,
            reachable: true,
            reply: reply.map(str::to_string),
            calls: AtomicUsize::new(0),
            seen_credential: Mutex::new(None),
        })
    }

    pub fn unreachable(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            local: true,
            reachable: false,
            reply: Ok("unreachable backends never answer".to_string()),
            calls: AtomicUsize::new(0),
            seen_credential: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_credential(&self) -> Option<String> {
        self.seen_credential.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        if self.local {
            BackendKind::Ollama
        } else {
            BackendKind::Anthropic
        }
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn context_window(&self) -> usize {
        2048
    }

    fn max_response_tokens(&self) -> usize {
        256
    }

    async fn probe(&self) -> bool {
        self.reachable
    }

    async fn invoke(
        &self,
        _prompt: &AssembledPrompt,
        _max_tokens: usize,
        credential: Option<&SecretString>,
    ) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_credential.lock().unwrap() = credential.map(|c| c.expose_secret().clone());
        self.reply.clone()
    }
}

pub struct Fixture {
    pub gateway: ModelGateway,
    pub cache: Arc<ResponseCache>,
    pub vault: Arc<CredentialVault>,
}

pub fn gateway(backends: Vec<Arc<MockBackend>>, priority: &[&str]) -> Fixture {
    gateway_with_cache(backends, priority, &CacheConfig::default())
}

pub fn gateway_with_cache(
    backends: Vec<Arc<MockBackend>>,
    priority: &[&str],
    cache_config: &CacheConfig,
) -> Fixture {
    let cache = Arc::new(ResponseCache::new(cache_config));
    let vault = Arc::new(CredentialVault::in_memory(Some(VAULT_KEY)));
    let slots = backends
        .into_iter()
        .map(|b| (b as Arc<dyn ModelBackend>, None))
        .collect();
    let gateway = ModelGateway::new(
        slots,
        priority.iter().map(|s| s.to_string()).collect(),
        Arc::clone(&cache),
        Arc::clone(&vault),
        &GatewayConfig::default(),
    );
    Fixture {
        gateway,
        cache,
        vault,
    }
}
