// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Password-gated admin surface
//!
//! `authenticate` compares against the configured admin password in constant
//! time and hands out an [`AdminToken`]. Tokens can only be minted here and
//! expire after [`ADMIN_TOKEN_TTL`]. Every admin operation is a read-only
//! snapshot or a maintenance action routed through the owning component.

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::cache::{CacheStats, ResponseCache};
use crate::crypto::CredentialVault;
use crate::errors::{EngineError, EngineResult};
use crate::gateway::{TemplateStats, TemplateStore};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::rag::{RetrievalEngine, RetrievalStats};
use crate::rate_limit::RateLimiter;
use crate::session::{SessionManager, SessionStats, SessionSummary};

pub const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Proof of a successful admin login
#[derive(Debug, Clone)]
pub struct AdminToken {
    issued_at: Instant,
}

impl AdminToken {
    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= ADMIN_TOKEN_TTL
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemStats {
    pub sessions: SessionStats,
    pub retrieval: RetrievalStats,
    pub cache: CacheStats,
    pub templates: TemplateStats,
    pub rate_limit_windows: usize,
    pub stored_credentials: usize,
    pub version: String,
}

pub struct AdminConsole {
    password_digest: Option<[u8; 32]>,
    sessions: Arc<SessionManager>,
    retrieval: Arc<RetrievalEngine>,
    cache: Arc<ResponseCache>,
    templates: Arc<TemplateStore>,
    limiter: Arc<RateLimiter>,
    vault: Arc<CredentialVault>,
    metrics: Arc<MetricsCollector>,
}

fn digest(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

impl AdminConsole {
    pub fn new(
        password: Option<&SecretString>,
        sessions: Arc<SessionManager>,
        retrieval: Arc<RetrievalEngine>,
        cache: Arc<ResponseCache>,
        templates: Arc<TemplateStore>,
        limiter: Arc<RateLimiter>,
        vault: Arc<CredentialVault>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let password_digest = password
            .map(|p| p.expose_secret().as_str())
            .filter(|p| !p.is_empty())
            .map(digest);
        if password_digest.is_none() {
            info!("No admin password configured; admin access disabled");
        }
        Self {
            password_digest,
            sessions,
            retrieval,
            cache,
            templates,
            limiter,
            vault,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.password_digest.is_some()
    }

    pub fn authenticate(&self, password: &str) -> EngineResult<AdminToken> {
        let Some(expected) = &self.password_digest else {
            return Err(EngineError::AdminAccessDenied);
        };
        let supplied = digest(password);
        if bool::from(supplied[..].ct_eq(&expected[..])) {
            info!("Admin authenticated");
            Ok(AdminToken {
                issued_at: Instant::now(),
            })
        } else {
            warn!("Rejected admin login attempt");
            Err(EngineError::AdminAccessDenied)
        }
    }

    fn authorize(&self, token: &AdminToken) -> EngineResult<()> {
        if !self.is_enabled() || token.is_expired() {
            return Err(EngineError::AdminAccessDenied);
        }
        Ok(())
    }

    pub async fn system_stats(&self, token: &AdminToken) -> EngineResult<SystemStats> {
        self.authorize(token)?;
        Ok(SystemStats {
            sessions: self.sessions.stats().await,
            retrieval: self.retrieval.stats().await,
            cache: self.cache.stats(),
            templates: self.templates.stats().await,
            rate_limit_windows: self.limiter.tracked_windows(),
            stored_credentials: self.vault.list().await.len(),
            version: crate::version::get_version_string(),
        })
    }

    pub fn metrics_summary(&self, token: &AdminToken) -> EngineResult<MetricsSummary> {
        self.authorize(token)?;
        Ok(self.metrics.summary())
    }

    /// Prometheus text exposition
    pub fn metrics_text(&self, token: &AdminToken) -> EngineResult<String> {
        self.authorize(token)?;
        Ok(self.metrics.render())
    }

    pub async fn list_sessions(&self, token: &AdminToken) -> EngineResult<Vec<SessionSummary>> {
        self.authorize(token)?;
        Ok(self.sessions.list_sessions(None).await)
    }

    /// Backend names with a stored credential; never the secrets
    pub async fn list_credentials(&self, token: &AdminToken) -> EngineResult<Vec<String>> {
        self.authorize(token)?;
        Ok(self.vault.list().await)
    }

    pub fn clear_cache(&self, token: &AdminToken) -> EngineResult<usize> {
        self.authorize(token)?;
        let cleared = self.cache.len();
        self.cache.clear();
        info!("Admin cleared {} cache entries", cleared);
        Ok(cleared)
    }

    pub async fn evict_idle_sessions(&self, token: &AdminToken) -> EngineResult<usize> {
        self.authorize(token)?;
        let evicted = self.sessions.evict_idle(Utc::now()).await;
        self.metrics.set_active_sessions(self.sessions.len());
        Ok(evicted)
    }
}
