// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod admin;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod crypto;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod rag;
pub mod rate_limit;
pub mod sandbox;
pub mod session;
pub mod version;

pub use admin::{AdminConsole, AdminToken, SystemStats};
pub use cache::ResponseCache;
pub use config::EngineConfig;
pub use context::EngineContext;
pub use crypto::CredentialVault;
pub use errors::{EngineError, EngineResult};
pub use gateway::{Completion, CompletionRequest, ModelBackend, ModelGateway};
pub use metrics::MetricsCollector;
pub use rag::{DocumentScope, RetrievalEngine};
pub use rate_limit::{OperationKind, RateLimiter};
pub use sandbox::{CodeSandbox, ExecutionOutput, Violation};
pub use session::{ChatPipeline, ChatReply, Message, Role, SessionHandle, SessionManager};
