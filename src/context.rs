// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Engine context
//!
//! Every component is constructed exactly once here and shared through
//! `Arc`s. Front-ends call the context; nothing reaches into component
//! internals. `shutdown` stops background tasks and flushes persisted state.

use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::AdminConsole;
use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::crypto::CredentialVault;
use crate::errors::{EngineError, EngineResult};
use crate::gateway::{backends_from_config, ModelBackend, ModelGateway, TemplateStore};
use crate::metrics::MetricsCollector;
use crate::rag::{embedder_from_config, index_from_config, DocumentScope, RetrievalEngine, TextChunker};
use crate::rate_limit::{OperationKind, RateLimiter};
use crate::sandbox::{CodeSandbox, ExecutionOutput, Violation};
use crate::session::{ChatPipeline, ChatReply, FileSessionStore, SessionHandle, SessionManager};

pub struct EngineContext {
    pub config: EngineConfig,
    pub vault: Arc<CredentialVault>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
    pub metrics: Arc<MetricsCollector>,
    pub retrieval: Arc<RetrievalEngine>,
    pub gateway: Arc<ModelGateway>,
    pub templates: Arc<TemplateStore>,
    pub sessions: Arc<SessionManager>,
    pub pipeline: ChatPipeline,
    pub sandbox: CodeSandbox,
    pub admin: AdminConsole,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineContext {
    /// Build the engine with the HTTP backends named in `config`
    pub async fn initialize(config: EngineConfig) -> EngineResult<Self> {
        let backends = backends_from_config(&config)?;
        Self::initialize_with_backends(config, backends).await
    }

    /// Build the engine around caller-supplied backends
    pub async fn initialize_with_backends(
        config: EngineConfig,
        backends: Vec<(Arc<dyn ModelBackend>, Option<u32>)>,
    ) -> EngineResult<Self> {
        config.validate()?;
        info!("Initializing {}", crate::version::get_version_string());
        info!("Data directory: {}", config.data_dir.display());

        let vault = Arc::new(CredentialVault::open(config.credentials_path(), config.vault_key()?).await?);
        if !vault.has_key() {
            warn!("No encryption key configured; remote backend credentials cannot be stored");
        }

        let metrics = Arc::new(MetricsCollector::new()?);
        let cache = Arc::new(ResponseCache::new(&config.cache).with_metrics(Arc::clone(&metrics)));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        let retrieval = RetrievalEngine::new(
            TextChunker::new(config.retrieval.chunk_size, config.retrieval.chunk_overlap)?,
            embedder_from_config(&config.retrieval)?,
            index_from_config(&config.retrieval),
            Arc::clone(&cache),
        )?
        .with_store(config.vector_store_dir())
        .await?;
        let retrieval = Arc::new(retrieval);

        let gateway = Arc::new(ModelGateway::new(
            backends,
            config.model_backend_priority.clone(),
            Arc::clone(&cache),
            Arc::clone(&vault),
            &config.gateway,
        ));
        info!("Model backends: {:?}", gateway.backend_names());

        let templates = Arc::new(TemplateStore::open(config.templates_path()).await?);

        let sessions = Arc::new(
            SessionManager::new(&config.session)
                .with_store(Arc::new(FileSessionStore::new(config.sessions_dir()))),
        );
        sessions.restore().await?;
        metrics.set_active_sessions(sessions.len());

        let pipeline = ChatPipeline::new(
            Arc::clone(&sessions),
            Arc::clone(&limiter),
            Arc::clone(&retrieval),
            Arc::clone(&gateway),
            Arc::clone(&templates),
            Arc::clone(&metrics),
            config.session.default_template.clone(),
            config.retrieval.top_k,
            config.gateway.request_timeout() * 2,
            config.input,
        );

        let sandbox = CodeSandbox::new(&config.sandbox, config.code_execution_enabled);
        let admin = AdminConsole::new(
            config.admin_password.as_ref(),
            Arc::clone(&sessions),
            Arc::clone(&retrieval),
            Arc::clone(&cache),
            Arc::clone(&templates),
            Arc::clone(&limiter),
            Arc::clone(&vault),
            Arc::clone(&metrics),
        );

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        if config.cache.enabled {
            tasks.push(cache.spawn_sweeper(config.cache.sweep_interval(), shutdown.clone()));
        }
        tasks.push(spawn_maintenance(
            Arc::clone(&sessions),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
            config.cache.sweep_interval(),
            shutdown.clone(),
        ));

        info!("Engine ready");
        Ok(Self {
            config,
            vault,
            limiter,
            cache,
            metrics,
            retrieval,
            gateway,
            templates,
            sessions,
            pipeline,
            sandbox,
            admin,
            shutdown,
            tasks,
        })
    }

    pub async fn create_session(&self, identity: &str) -> EngineResult<SessionHandle> {
        let handle = self.sessions.create_session(identity).await?;
        self.metrics.set_active_sessions(self.sessions.len());
        Ok(handle)
    }

    pub async fn delete_session(&self, handle: &SessionHandle) -> EngineResult<bool> {
        let deleted = self.sessions.delete(handle).await?;
        self.metrics.set_active_sessions(self.sessions.len());
        Ok(deleted)
    }

    pub async fn chat(&self, handle: &SessionHandle, text: &str) -> EngineResult<ChatReply> {
        self.pipeline.chat(handle, text).await
    }

    pub async fn ingest(&self, identity: &str, document_id: &str, text: &str) -> EngineResult<usize> {
        self.pipeline.ingest(identity, document_id, text).await
    }

    /// Pin (or unpin) the backend tried first for a session
    pub async fn set_backend(&self, handle: &SessionHandle, backend: Option<&str>) -> EngineResult<()> {
        if let Some(name) = backend {
            if !self.gateway.has_backend(name) {
                return Err(EngineError::InvalidInput(format!("unknown backend: {}", name)));
            }
        }
        self.sessions
            .set_backend(handle, backend.map(str::to_string))
            .await
    }

    pub async fn set_template(&self, handle: &SessionHandle, template: Option<&str>) -> EngineResult<()> {
        if let Some(name) = template {
            if self.templates.get(name).await.is_none() {
                return Err(EngineError::TemplateNotFound(name.to_string()));
            }
        }
        self.sessions
            .set_template(handle, template.map(str::to_string))
            .await
    }

    pub async fn set_documents(&self, handle: &SessionHandle, documents: DocumentScope) -> EngineResult<()> {
        self.sessions.set_documents(handle, documents).await
    }

    pub async fn store_credential(&self, backend: &str, secret: SecretString) -> EngineResult<()> {
        self.vault.store(backend, secret).await?;
        Ok(())
    }

    pub fn validate_code(&self, source: &str) -> Vec<Violation> {
        self.sandbox.validate(source)
    }

    /// Rate-limited sandbox execution on behalf of `identity`
    pub async fn execute_code(
        &self,
        identity: &str,
        source: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<ExecutionOutput> {
        self.limiter.check(identity, OperationKind::Execute)?;
        let start = std::time::Instant::now();
        let result = self.sandbox.execute(source, timeout).await;
        self.metrics.record("execute", start.elapsed(), result.is_ok());
        result.map_err(EngineError::from)
    }

    /// Stop background tasks and flush everything persisted
    pub async fn shutdown(self) -> EngineResult<()> {
        info!("Shutting down engine");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.sessions.flush().await?;
        self.templates.flush().await?;
        self.retrieval.flush().await?;
        self.cache.clear();
        info!("Engine stopped");
        Ok(())
    }
}

/// Idle-session eviction and rate-limit window cleanup
fn spawn_maintenance(
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Maintenance task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = sessions.evict_idle(Utc::now()).await;
                    let windows = limiter.cleanup_expired();
                    metrics.set_active_sessions(sessions.len());
                    if evicted > 0 || windows > 0 {
                        debug!("Maintenance evicted {} sessions, {} rate windows", evicted, windows);
                    }
                }
            }
        }
    })
}
