// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Engine configuration
//!
//! Loaded from a TOML file, then overlaid with environment variables
//! (a `.env` file is honoured). Secrets stay wrapped in `Secret<String>` so
//! they never show up in `Debug` output or logs.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::gateway::BackendKind;
use crate::session::InputLimits;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub admin_password: Option<Secret<String>>,
    /// Base64 of a 32-byte AES-256 key
    pub encryption_key: Option<Secret<String>>,
    pub code_execution_enabled: bool,
    pub model_backend_priority: Vec<String>,
    pub backends: Vec<BackendConfig>,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub retrieval: RetrievalConfig,
    pub session: SessionConfig,
    pub sandbox: SandboxConfig,
    pub gateway: GatewayConfig,
    pub input: InputLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            admin_password: None,
            encryption_key: None,
            code_execution_enabled: false,
            model_backend_priority: Vec::new(),
            backends: vec![BackendConfig::default()],
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retrieval: RetrievalConfig::default(),
            session: SessionConfig::default(),
            sandbox: SandboxConfig::default(),
            gateway: GatewayConfig::default(),
            input: InputLimits::default(),
        }
    }
}

/// One model backend entry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub endpoint: String,
    pub model: String,
    /// Context window in tokens
    pub context_window: usize,
    /// Tokens reserved for the response
    pub max_response_tokens: usize,
    /// Outbound throttle; `None` disables it
    pub requests_per_minute: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "ollama".to_string(),
            kind: BackendKind::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            context_window: 4096,
            max_response_tokens: 1024,
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL for any kind without its own setting
    pub default_ttl_secs: u64,
    pub embedding_ttl_secs: Option<u64>,
    pub completion_ttl_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            embedding_ttl_secs: Some(7 * 24 * 3600),
            completion_ttl_secs: None,
            sweep_interval_secs: 300,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn embedding_ttl(&self) -> Duration {
        self.embedding_ttl_secs
            .map_or_else(|| self.default_ttl(), Duration::from_secs)
    }

    pub fn completion_ttl(&self) -> Duration {
        self.completion_ttl_secs
            .map_or_else(|| self.default_ttl(), Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Quota for one operation kind
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl QuotaConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_requests: u32,
    /// Per-operation overrides keyed by operation name (`chat`, `ingest`, ...)
    pub operations: HashMap<String, QuotaConfig>,
}

impl Default for RateLimitConfig {
    /// One global quota; per-operation entries come only from configuration
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 3600,
            max_requests: 100,
            operations: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Flat,
    Hnsw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Chunk size in characters
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub embedding_dimension: usize,
    pub index: IndexKind,
    /// Optional OpenAI-compatible embeddings endpoint; local hashing otherwise
    pub embedding_endpoint: Option<String>,
    pub embedding_model: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 5,
            embedding_dimension: 384,
            index: IndexKind::Flat,
            embedding_endpoint: None,
            embedding_model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    /// History budget used when the backend does not constrain it further
    pub max_history_tokens: usize,
    pub default_template: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 24 * 3600,
            max_history_tokens: 2000,
            default_template: "assistant".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-I".to_string()],
            timeout_secs: 10,
            max_output_bytes: 10_000,
            max_source_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-invocation timeout
    pub request_timeout_secs: u64,
    /// How long a probe result is trusted
    pub probe_ttl_secs: u64,
    /// Share of the post-preamble budget given to retrieved chunks
    pub context_share: f32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            probe_ttl_secs: 30,
            context_share: 0.6,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay recognised environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("RAG_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("RAG_ADMIN_PASSWORD") {
            self.admin_password = Some(Secret::new(val));
        }
        if let Some(val) = lookup("RAG_ENCRYPTION_KEY") {
            self.encryption_key = Some(Secret::new(val));
        }
        if let Some(val) = lookup("RAG_CODE_EXECUTION_ENABLED") {
            self.code_execution_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Some(num) = lookup("RAG_CACHE_DEFAULT_TTL").and_then(|v| v.parse().ok()) {
            self.cache.default_ttl_secs = num;
        }
        if let Some(num) = lookup("RAG_RATE_LIMIT_WINDOW").and_then(|v| v.parse().ok()) {
            self.rate_limit.window_secs = num;
        }
        if let Some(num) = lookup("RAG_RATE_LIMIT_MAX_REQUESTS").and_then(|v| v.parse().ok()) {
            self.rate_limit.max_requests = num;
        }
        if let Some(val) = lookup("RAG_MODEL_BACKEND_PRIORITY") {
            self.model_backend_priority = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        debug!("Environment overrides applied");
    }

    pub fn validate(&self) -> EngineResult<()> {
        let retrieval = &self.retrieval;
        if retrieval.chunk_size == 0 {
            return Err(EngineError::Config("retrieval.chunk_size must be > 0".into()));
        }
        if retrieval.chunk_overlap >= retrieval.chunk_size {
            return Err(EngineError::Config(format!(
                "retrieval.chunk_overlap ({}) must be smaller than chunk_size ({})",
                retrieval.chunk_overlap, retrieval.chunk_size
            )));
        }
        if retrieval.embedding_dimension == 0 {
            return Err(EngineError::Config(
                "retrieval.embedding_dimension must be > 0".into(),
            ));
        }

        if self.rate_limit.window_secs == 0 || self.rate_limit.max_requests == 0 {
            return Err(EngineError::Config(
                "rate_limit window and max_requests must be > 0".into(),
            ));
        }
        for (op, quota) in &self.rate_limit.operations {
            if quota.window_secs == 0 || quota.max_requests == 0 {
                return Err(EngineError::Config(format!(
                    "rate_limit.operations.{} must have non-zero window and quota",
                    op
                )));
            }
        }

        if self.cache.default_ttl_secs == 0
            || self.cache.embedding_ttl_secs == Some(0)
            || self.cache.completion_ttl_secs == Some(0)
        {
            return Err(EngineError::Config("cache TTLs must be > 0".into()));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate backend name: {}",
                    backend.name
                )));
            }
            if backend.max_response_tokens >= backend.context_window {
                return Err(EngineError::Config(format!(
                    "backend {}: max_response_tokens must be below context_window",
                    backend.name
                )));
            }
        }

        if self.encryption_key.is_some() {
            self.vault_key()?;
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(EngineError::Config("cache.sweep_interval_secs must be > 0".into()));
        }
        if self.gateway.request_timeout_secs == 0 || self.sandbox.timeout_secs == 0 {
            return Err(EngineError::Config(
                "gateway and sandbox timeouts must be > 0".into(),
            ));
        }
        if self.input.max_message_chars == 0 || self.input.max_document_bytes == 0 {
            return Err(EngineError::Config("input limits must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.gateway.context_share) {
            return Err(EngineError::Config(
                "gateway.context_share must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    /// Decode the vault key material
    ///
    /// Returns `None` when no key is configured.
    pub fn vault_key(&self) -> EngineResult<Option<[u8; 32]>> {
        let Some(secret) = &self.encryption_key else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(secret.expose_secret().trim())
            .map_err(|_| EngineError::Config("encryption_key is not valid base64".into()))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            EngineError::Config("encryption_key must decode to exactly 32 bytes".into())
        })?;
        Ok(Some(key))
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.data_dir.join("vector_store")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn templates_path(&self) -> PathBuf {
        self.data_dir.join("prompts").join("templates.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }
}
