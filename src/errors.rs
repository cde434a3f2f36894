// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Engine-wide error taxonomy
//!
//! Every failure that crosses a component boundary is one of these variants so
//! the surrounding front-end can render a specific message:
//! - Session errors (unknown handle)
//! - Retrieval errors (no grounding available, recoverable)
//! - Backend errors (unavailable, rate limited, invalid response)
//! - Vault errors (credential missing, key material invalid)
//! - Sandbox errors (security violation, timeout, execution failure)
//! - Admission errors (rate limit exceeded, with retry-after hint)

use std::time::Duration;
use thiserror::Error;

use crate::crypto::VaultError;
use crate::gateway::BackendError;
use crate::sandbox::SandboxError;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Handle does not name a live session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No indexed chunks for the requested document set
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Backend unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Backend {backend} rate limited the request")]
    BackendRateLimited {
        backend: String,
        retry_after: Option<Duration>,
    },

    #[error("Backend {backend} returned an invalid response: {reason}")]
    BackendInvalidResponse { backend: String, reason: String },

    #[error("No credential stored for backend: {0}")]
    CredentialNotFound(String),

    #[error("Credential vault error: {0}")]
    Vault(String),

    #[error("Security violation: {}", .violations.join("; "))]
    SecurityViolation { violations: Vec<String> },

    #[error("Execution timed out after {}s", .timeout.as_secs_f32())]
    ExecutionTimeout { timeout: Duration },

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("Code execution is disabled")]
    ExecutionDisabled,

    #[error("Rate limit exceeded for {operation}: retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded {
        operation: String,
        retry_after: Duration,
    },

    #[error("Prompt template not found: {0}")]
    TemplateNotFound(String),

    #[error("Prompt template {template} is missing variable {variable}")]
    TemplateVariableMissing { template: String, variable: String },

    #[error("Prompt template already exists: {0}")]
    TemplateExists(String),

    #[error("Admin access denied")]
    AdminAccessDenied,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable error code for logging and metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            EngineError::RetrievalUnavailable(_) => "RETRIEVAL_UNAVAILABLE",
            EngineError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            EngineError::BackendRateLimited { .. } => "BACKEND_RATE_LIMITED",
            EngineError::BackendInvalidResponse { .. } => "BACKEND_INVALID_RESPONSE",
            EngineError::CredentialNotFound(_) => "CREDENTIAL_NOT_FOUND",
            EngineError::Vault(_) => "VAULT_ERROR",
            EngineError::SecurityViolation { .. } => "SECURITY_VIOLATION",
            EngineError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            EngineError::ExecutionError(_) => "EXECUTION_ERROR",
            EngineError::ExecutionDisabled => "EXECUTION_DISABLED",
            EngineError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            EngineError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            EngineError::TemplateVariableMissing { .. } => "TEMPLATE_VARIABLE_MISSING",
            EngineError::TemplateExists(_) => "TEMPLATE_EXISTS",
            EngineError::AdminAccessDenied => "ADMIN_ACCESS_DENIED",
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Message suitable for showing to the end user
    pub fn user_message(&self) -> String {
        match self {
            EngineError::SessionNotFound(_) => {
                "Your session has expired or does not exist. Start a new conversation.".to_string()
            }
            EngineError::RetrievalUnavailable(_) => {
                "No documents are available to ground this answer.".to_string()
            }
            EngineError::BackendUnavailable { .. } => {
                "No model backend is reachable right now. Try again shortly.".to_string()
            }
            EngineError::BackendRateLimited { backend, .. } => {
                format!("The model backend {} is throttling requests.", backend)
            }
            EngineError::CredentialNotFound(backend) => {
                format!("No API key is configured for {}.", backend)
            }
            EngineError::RateLimitExceeded {
                operation,
                retry_after,
            } => format!(
                "Too many {} requests. Retry in {} seconds.",
                operation,
                retry_after.as_secs().max(1)
            ),
            EngineError::ExecutionTimeout { timeout } => {
                format!("Code ran longer than {} seconds and was stopped.", timeout.as_secs())
            }
            EngineError::SecurityViolation { violations } => {
                format!("Code rejected: {}", violations.join("; "))
            }
            _ => self.to_string(),
        }
    }

    /// Recoverable conditions are absorbed by a documented fallback
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::RetrievalUnavailable(_)
                | EngineError::BackendUnavailable { .. }
                | EngineError::BackendRateLimited { .. }
                | EngineError::BackendInvalidResponse { .. }
                | EngineError::CredentialNotFound(_)
        )
    }

    /// Retry-after hint for admission and backend throttling failures
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            EngineError::BackendRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable { backend, reason } => {
                EngineError::BackendUnavailable { backend, reason }
            }
            BackendError::RateLimited {
                backend,
                retry_after,
            } => EngineError::BackendRateLimited {
                backend,
                retry_after,
            },
            BackendError::InvalidResponse { backend, reason } => {
                EngineError::BackendInvalidResponse { backend, reason }
            }
            BackendError::MissingCredential(backend) => EngineError::CredentialNotFound(backend),
        }
    }
}

impl From<VaultError> for EngineError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::CredentialNotFound(backend) => EngineError::CredentialNotFound(backend),
            other => EngineError::Vault(other.to_string()),
        }
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::SecurityViolation(violations) => EngineError::SecurityViolation {
                violations: violations.iter().map(|v| v.to_string()).collect(),
            },
            SandboxError::Timeout(timeout) => EngineError::ExecutionTimeout { timeout },
            SandboxError::Execution(reason) => EngineError::ExecutionError(reason),
            SandboxError::Disabled => EngineError::ExecutionDisabled,
        }
    }
}
