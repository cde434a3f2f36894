// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model gateway
//!
//! Coordinates backend selection, prompt budgeting, the completion cache,
//! outbound throttling and transient credential access.
//!
//! Candidate order for a call: the session's pinned backend, then the
//! configured priority list, then every remaining backend with local ones
//! first. Unreachable backends (cached probe) and remote backends without a
//! credential are skipped. At most two invocations are made per call: the
//! first candidate and one retry on the next.

pub mod backend;
pub mod backends;
pub mod prompt;
pub mod templates;

use dashmap::DashMap;
use futures::future::join_all;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use backend::{BackendError, BackendKind, ModelBackend};
pub use backends::build_backend;
pub use prompt::{estimate_tokens, AssembledPrompt, CompletionRequest, PromptAssembler, PromptTurn};
pub use templates::{PromptTemplate, TemplateStats, TemplateStore, TemplateUsage};

use crate::cache::{CacheKey, CachedValue, ResponseCache};
use crate::config::{EngineConfig, GatewayConfig};
use crate::crypto::{CredentialVault, VaultError};
use crate::errors::{EngineError, EngineResult};

/// Invocations per call: the first attempt plus one retry
const MAX_ATTEMPTS: usize = 2;

/// Outbound throttle for one backend
struct Throttle {
    limiter: GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
}

impl Throttle {
    fn new(requests_per_minute: u32) -> Option<Self> {
        let rpm = NonZeroU32::new(requests_per_minute)?;
        Some(Self {
            limiter: GovRateLimiter::direct(Quota::per_minute(rpm)),
            clock: DefaultClock::default(),
        })
    }

    fn check(&self, backend: &str) -> Result<(), BackendError> {
        self.limiter.check().map_err(|not_until| BackendError::RateLimited {
            backend: backend.to_string(),
            retry_after: Some(not_until.wait_time_from(self.clock.now())),
        })
    }
}

/// Slot list for [`ModelGateway::new`] built from the configured HTTP backends
pub fn backends_from_config(config: &EngineConfig) -> EngineResult<Vec<(Arc<dyn ModelBackend>, Option<u32>)>> {
    let mut backends = Vec::with_capacity(config.backends.len());
    for backend_config in &config.backends {
        let backend = build_backend(backend_config, config.gateway.request_timeout())?;
        backends.push((backend, backend_config.requests_per_minute));
    }
    for name in &config.model_backend_priority {
        if !config.backends.iter().any(|b| &b.name == name) {
            warn!("Backend priority names unknown backend {}", name);
        }
    }
    Ok(backends)
}

struct BackendSlot {
    backend: Arc<dyn ModelBackend>,
    throttle: Option<Throttle>,
}

#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    available: bool,
    checked_at: Instant,
}

/// Outcome of a successful completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub backend: String,
    pub cached: bool,
    pub context_chunk_ids: Vec<u64>,
    pub prompt_tokens: usize,
}

/// Snapshot of one backend for status displays
#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct BackendStatus {
    pub name: String,
    pub kind: BackendKind,
    pub local: bool,
    pub context_window: usize,
    /// `None` until probed
    pub available: Option<bool>,
}

pub struct ModelGateway {
    slots: Vec<BackendSlot>,
    priority: Vec<String>,
    cache: Arc<ResponseCache>,
    vault: Arc<CredentialVault>,
    assembler: PromptAssembler,
    request_timeout: Duration,
    probe_ttl: Duration,
    probes: DashMap<String, ProbeResult>,
}

impl ModelGateway {
    pub fn new(
        backends: Vec<(Arc<dyn ModelBackend>, Option<u32>)>,
        priority: Vec<String>,
        cache: Arc<ResponseCache>,
        vault: Arc<CredentialVault>,
        config: &GatewayConfig,
    ) -> Self {
        let slots = backends
            .into_iter()
            .map(|(backend, rpm)| BackendSlot {
                throttle: rpm.and_then(Throttle::new),
                backend,
            })
            .collect();

        Self {
            slots,
            priority,
            cache,
            vault,
            assembler: PromptAssembler::new(config.context_share),
            request_timeout: config.request_timeout(),
            probe_ttl: config.probe_ttl(),
            probes: DashMap::new(),
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.backend.name().to_string())
            .collect()
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.slots.iter().any(|s| s.backend.name() == name)
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.slots
            .iter()
            .map(|s| BackendStatus {
                name: s.backend.name().to_string(),
                kind: s.backend.kind(),
                local: s.backend.is_local(),
                context_window: s.backend.context_window(),
                available: self.probes.get(s.backend.name()).map(|p| p.available),
            })
            .collect()
    }

    /// Backends in the order they would be tried
    pub fn candidate_order(&self, pinned: Option<&str>) -> Vec<&str> {
        let mut requested: Vec<&BackendSlot> = Vec::new();
        if let Some(slot) = pinned.and_then(|name| self.slot(name)) {
            requested.push(slot);
        }
        requested.extend(self.priority.iter().filter_map(|name| self.slot(name)));
        requested.extend(self.slots.iter().filter(|s| s.backend.is_local()));
        requested.extend(self.slots.iter().filter(|s| !s.backend.is_local()));

        let mut order: Vec<&str> = Vec::with_capacity(self.slots.len());
        for slot in requested {
            let name = slot.backend.name();
            if !order.contains(&name) {
                order.push(name);
            }
        }
        order
    }

    fn slot(&self, name: &str) -> Option<&BackendSlot> {
        self.slots.iter().find(|s| s.backend.name() == name)
    }

    /// Assemble a prompt for the chosen backend and return its completion
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        pinned: Option<&str>,
    ) -> EngineResult<Completion> {
        if self.slots.is_empty() {
            return Err(EngineError::BackendUnavailable {
                backend: "none".to_string(),
                reason: "no model backends configured".to_string(),
            });
        }

        let mut failures: Vec<BackendError> = Vec::new();
        let mut attempts = 0;

        for name in self.candidate_order(pinned) {
            if attempts >= MAX_ATTEMPTS {
                break;
            }
            let Some(slot) = self.slot(name) else {
                continue;
            };
            let backend = &slot.backend;

            let budget = backend
                .context_window()
                .saturating_sub(backend.max_response_tokens());
            let prompt = self.assembler.assemble(request, budget);
            let key = CacheKey::completion(name, &prompt.normalized());

            if let Some(text) = self.cache.get_completion(&key) {
                debug!("Completion cache hit on backend {}", name);
                return Ok(Completion {
                    text,
                    backend: name.to_string(),
                    cached: true,
                    context_chunk_ids: prompt.context_chunk_ids,
                    prompt_tokens: prompt.estimated_tokens,
                });
            }

            if !self.is_available(backend.as_ref()).await {
                failures.push(BackendError::unavailable(name, "probe failed"));
                continue;
            }

            let credential = if backend.requires_credential() {
                match self.vault.retrieve(name).await {
                    Ok(secret) => Some(secret),
                    Err(VaultError::CredentialNotFound(_)) => {
                        debug!("Skipping backend {}: no credential", name);
                        failures.push(BackendError::MissingCredential(name.to_string()));
                        continue;
                    }
                    Err(e) => {
                        warn!("Skipping backend {}: {}", name, e);
                        failures.push(BackendError::unavailable(name, e));
                        continue;
                    }
                }
            } else {
                None
            };

            if let Some(throttle) = &slot.throttle {
                if let Err(e) = throttle.check(name) {
                    warn!("Backend {} throttled locally", name);
                    failures.push(e);
                    continue;
                }
            }

            attempts += 1;
            let start = Instant::now();
            let result = tokio::time::timeout(
                self.request_timeout,
                backend.invoke(&prompt, backend.max_response_tokens(), credential.as_ref()),
            )
            .await
            .unwrap_or_else(|_| Err(BackendError::unavailable(name, "request timed out")));
            drop(credential);

            match result {
                Ok(text) => {
                    self.mark(name, true);
                    self.cache
                        .put(key, CachedValue::Completion(text.clone()), None);
                    info!(
                        "Completion from {} in {}ms (~{} prompt tokens)",
                        name,
                        start.elapsed().as_millis(),
                        prompt.estimated_tokens
                    );
                    return Ok(Completion {
                        text,
                        backend: name.to_string(),
                        cached: false,
                        context_chunk_ids: prompt.context_chunk_ids,
                        prompt_tokens: prompt.estimated_tokens,
                    });
                }
                Err(e) => {
                    warn!("Backend {} failed: {}, trying next", name, e);
                    if e.marks_unavailable() {
                        self.mark(name, false);
                    }
                    failures.push(e);
                }
            }
        }

        Err(Self::surface(failures))
    }

    /// A lone failure keeps its specific type; several collapse to unavailable
    fn surface(mut failures: Vec<BackendError>) -> EngineError {
        if failures.len() == 1 {
            if let Some(only) = failures.pop() {
                return only.into();
            }
        }
        let reason = if failures.is_empty() {
            "no backend could be tried".to_string()
        } else {
            failures
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        };
        EngineError::BackendUnavailable {
            backend: "all".to_string(),
            reason,
        }
    }

    async fn is_available(&self, backend: &dyn ModelBackend) -> bool {
        let name = backend.name();
        if let Some(probe) = self.probes.get(name).map(|p| *p) {
            if probe.checked_at.elapsed() < self.probe_ttl {
                return probe.available;
            }
        }
        let available = backend.probe().await;
        if !available {
            warn!("Backend {} did not answer its probe", name);
        }
        self.mark(name, available);
        available
    }

    fn mark(&self, name: &str, available: bool) {
        self.probes.insert(
            name.to_string(),
            ProbeResult {
                available,
                checked_at: Instant::now(),
            },
        );
    }

    /// Probe every backend now, ignoring cached results
    pub async fn refresh_probes(&self) -> Vec<BackendStatus> {
        let probes = self.slots.iter().map(|slot| async move {
            (slot.backend.name(), slot.backend.probe().await)
        });
        for (name, available) in join_all(probes).await {
            self.mark(name, available);
        }
        self.status()
    }
}
