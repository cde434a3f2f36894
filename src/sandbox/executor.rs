// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Validated code execution in a child interpreter
//!
//! The child gets an empty environment apart from a fixed PATH, a private
//! temporary working directory, no stdin, and is killed on timeout or drop.
//! Output beyond the cap is read and discarded so the child never blocks on
//! a full pipe.

use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::validator::{CodeValidator, Violation};
use super::SandboxError;
use crate::config::SandboxConfig;

const TRUNCATION_NOTICE: &str = "\n[Output truncated...]";
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub duration_ms: u64,
}

pub struct CodeSandbox {
    enabled: bool,
    interpreter: String,
    interpreter_args: Vec<String>,
    default_timeout: Duration,
    max_output_bytes: usize,
    validator: CodeValidator,
}

impl CodeSandbox {
    pub fn new(config: &SandboxConfig, enabled: bool) -> Self {
        Self {
            enabled,
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            default_timeout: config.timeout(),
            max_output_bytes: config.max_output_bytes,
            validator: CodeValidator::new(config.max_source_bytes),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate(&self, source: &str) -> Vec<Violation> {
        self.validator.validate(source)
    }

    /// Validate, then run `source` with a hard wall-clock limit
    pub async fn execute(&self, source: &str, timeout: Option<Duration>) -> Result<ExecutionOutput, SandboxError> {
        if !self.enabled {
            return Err(SandboxError::Disabled);
        }

        let violations = self.validate(source);
        if !violations.is_empty() {
            warn!("Rejected code with {} violations", violations.len());
            return Err(SandboxError::SecurityViolation(violations));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let workdir = TempDir::new().map_err(|e| SandboxError::Execution(format!("workspace: {}", e)))?;
        let script = workdir.path().join("snippet.py");
        tokio::fs::write(&script, source)
            .await
            .map_err(|e| SandboxError::Execution(format!("workspace: {}", e)))?;

        let mut child = Command::new(&self.interpreter)
            .args(&self.interpreter_args)
            .arg(&script)
            .current_dir(workdir.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Execution(format!("failed to start {}: {}", self.interpreter, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Execution("stderr not captured".to_string()))?;

        let start = Instant::now();
        let max = self.max_output_bytes;
        let run = async {
            tokio::join!(read_capped(stdout, max), read_capped(stderr, max), child.wait())
        };
        let outcome = tokio::time::timeout(timeout, run).await;

        let (out, err, status) = match outcome {
            Ok(done) => done,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    debug!("Kill after timeout failed: {}", e);
                }
                warn!("Code execution timed out after {:?}", timeout);
                return Err(SandboxError::Timeout(timeout));
            }
        };

        let status = status.map_err(|e| SandboxError::Execution(e.to_string()))?;
        let (stdout, out_truncated) = out.map_err(|e| SandboxError::Execution(e.to_string()))?;
        let (stderr, err_truncated) = err.map_err(|e| SandboxError::Execution(e.to_string()))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !status.success() {
            let detail = stderr.trim();
            return Err(SandboxError::Execution(match status.code() {
                Some(code) if detail.is_empty() => format!("exited with status {}", code),
                Some(code) => format!("exited with status {}: {}", code, detail),
                None => "terminated by signal".to_string(),
            }));
        }

        info!("Code executed in {}ms", duration_ms);
        Ok(ExecutionOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            truncated: out_truncated || err_truncated,
            duration_ms,
        })
    }
}

/// Read to EOF keeping at most `max` bytes
async fn read_capped<R>(mut reader: R, max: usize) -> std::io::Result<(String, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(max.min(8192));
    let mut buf = [0u8; 4096];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = max.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_NOTICE);
    }
    Ok((text, truncated))
}
