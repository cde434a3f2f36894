// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Per-identity, per-operation admission control
//!
//! Each (identity, operation) pair owns an independent window anchored at its
//! first admitted call. Once the window's duration has elapsed the next access
//! starts a fresh window. Denied calls never consume quota. Admission is a
//! single shard-locked map update and never waits.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{QuotaConfig, RateLimitConfig};
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Chat,
    Ingest,
    Query,
    Execute,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Chat => "chat",
            OperationKind::Ingest => "ingest",
            OperationKind::Query => "query",
            OperationKind::Execute => "execute",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(OperationKind::Chat),
            "ingest" => Ok(OperationKind::Ingest),
            "query" => Ok(OperationKind::Query),
            "execute" => Ok(OperationKind::Execute),
            other => Err(EngineError::InvalidInput(format!(
                "unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
}

pub struct RateLimiter {
    enabled: bool,
    default_quota: QuotaConfig,
    quotas: Vec<(OperationKind, QuotaConfig)>,
    windows: DashMap<(String, OperationKind), Window>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut quotas = Vec::new();
        for (name, quota) in &config.operations {
            match name.parse::<OperationKind>() {
                Ok(kind) => quotas.push((kind, *quota)),
                Err(_) => warn!("Ignoring quota for unknown operation {}", name),
            }
        }

        Self {
            enabled: config.enabled,
            default_quota: QuotaConfig {
                window_secs: config.window_secs,
                max_requests: config.max_requests,
            },
            quotas,
            windows: DashMap::new(),
        }
    }

    pub fn quota(&self, op: OperationKind) -> QuotaConfig {
        self.quotas
            .iter()
            .find(|(kind, _)| *kind == op)
            .map(|(_, quota)| *quota)
            .unwrap_or(self.default_quota)
    }

    pub fn admit(&self, identity: &str, op: OperationKind) -> Admission {
        self.admit_at(identity, op, Instant::now())
    }

    /// Admission check against an explicit clock reading
    pub fn admit_at(&self, identity: &str, op: OperationKind, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allowed {
                remaining: u32::MAX,
            };
        }

        let quota = self.quota(op);
        let window_len = quota.window();

        let mut window = self
            .windows
            .entry((identity.to_string(), op))
            .or_insert(Window {
                start: now,
                count: 0,
            });

        if now.saturating_duration_since(window.start) >= window_len {
            window.start = now;
            window.count = 0;
        }

        if window.count >= quota.max_requests {
            let retry_after = (window.start + window_len).saturating_duration_since(now);
            debug!(
                "Denied {} for identity (retry in {:?}, limit {}/{:?})",
                op, retry_after, quota.max_requests, window_len
            );
            return Admission::Denied { retry_after };
        }

        window.count += 1;
        Admission::Allowed {
            remaining: quota.max_requests - window.count,
        }
    }

    /// Admission check that surfaces a denial as `RateLimitExceeded`
    pub fn check(&self, identity: &str, op: OperationKind) -> EngineResult<u32> {
        match self.admit(identity, op) {
            Admission::Allowed { remaining } => Ok(remaining),
            Admission::Denied { retry_after } => Err(EngineError::RateLimitExceeded {
                operation: op.to_string(),
                retry_after,
            }),
        }
    }

    /// Calls left in the live window without consuming one
    pub fn remaining(&self, identity: &str, op: OperationKind) -> u32 {
        let quota = self.quota(op);
        let now = Instant::now();
        match self.windows.get(&(identity.to_string(), op)) {
            Some(w) if now.saturating_duration_since(w.start) < quota.window() => {
                quota.max_requests.saturating_sub(w.count)
            }
            _ => quota.max_requests,
        }
    }

    /// Drop windows that have fully elapsed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|(_, op), window| {
            now.saturating_duration_since(window.start) < self.quota(*op).window()
        });
        before - self.windows.len()
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}
