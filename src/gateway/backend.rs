// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model backend trait definition

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::prompt::AssembledPrompt;

/// Closed set of supported backend protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Ollama `/api/generate`
    #[serde(rename = "ollama")]
    Ollama,
    /// OpenAI chat completions API (OpenAI, LM Studio, vLLM, ...)
    #[serde(rename = "openai_compatible", alias = "openai", alias = "lm_studio")]
    OpenAiCompatible,
    /// Anthropic messages API
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAiCompatible => "openai_compatible",
            BackendKind::Anthropic => "anthropic",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Backend {backend} rate limited (retry after {retry_after:?})")]
    RateLimited {
        backend: String,
        retry_after: Option<Duration>,
    },

    #[error("Backend {backend} returned an invalid response: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("No credential stored for backend {0}")]
    MissingCredential(String),
}

impl BackendError {
    pub fn unavailable(backend: &str, reason: impl ToString) -> Self {
        BackendError::Unavailable {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(backend: &str, reason: impl ToString) -> Self {
        BackendError::InvalidResponse {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn backend(&self) -> &str {
        match self {
            BackendError::Unavailable { backend, .. }
            | BackendError::RateLimited { backend, .. }
            | BackendError::InvalidResponse { backend, .. }
            | BackendError::MissingCredential(backend) => backend,
        }
    }

    /// Whether the backend should be considered down until the next probe
    pub fn marks_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}

/// Uniform completion capability over local and remote models
///
/// Implementations are stateless apart from their HTTP client; credentials
/// are passed per call and must not be retained.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Configured name, unique within the gateway
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Runs on this machine (no data leaves the host)
    fn is_local(&self) -> bool;

    /// Remote backends need a vault credential
    fn requires_credential(&self) -> bool {
        !self.is_local()
    }

    /// Total context window in tokens
    fn context_window(&self) -> usize;

    /// Tokens reserved for the response
    fn max_response_tokens(&self) -> usize;

    /// Cheap reachability check
    async fn probe(&self) -> bool;

    async fn invoke(
        &self,
        prompt: &AssembledPrompt,
        max_tokens: usize,
        credential: Option<&SecretString>,
    ) -> Result<String, BackendError>;
}
