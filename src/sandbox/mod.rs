// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Code sandbox
// Static validation of user snippets followed by time-boxed execution

pub mod executor;
pub mod lexer;
pub mod validator;

use std::time::Duration;
use thiserror::Error;

pub use executor::{CodeSandbox, ExecutionOutput};
pub use validator::{CodeValidator, Violation};

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Code rejected: {}", .0.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; "))]
    SecurityViolation(Vec<Violation>),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Code execution is disabled")]
    Disabled,
}
