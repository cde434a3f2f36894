// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Metrics collector
//!
//! Passive recorder backed by a private `prometheus` registry. Components
//! report operation timings and cache lookups; nothing here feeds back into
//! request handling.

use dashmap::DashSet;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};

use crate::errors::{EngineError, EngineResult};

/// Operations slower than this are logged at warn
pub const SLOW_OPERATION_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationSummary {
    pub operation: String,
    pub count: u64,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSummary {
    pub operations: Vec<OperationSummary>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub active_sessions: i64,
}

pub struct MetricsCollector {
    registry: Registry,
    operations_total: IntCounterVec,
    operation_duration: HistogramVec,
    cache_lookups: IntCounterVec,
    active_sessions: IntGauge,
    seen_operations: DashSet<String>,
}

fn metric_err(e: prometheus::Error) -> EngineError {
    error!("Failed to initialize metrics: {}", e);
    EngineError::Config(format!("metrics: {}", e))
}

impl MetricsCollector {
    pub fn new() -> EngineResult<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            Opts::new("rag_operations_total", "Engine operations by name and outcome"),
            &["operation", "outcome"],
        )
        .map_err(metric_err)?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "rag_operation_duration_seconds",
                "Engine operation latency in seconds",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["operation"],
        )
        .map_err(metric_err)?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("rag_cache_lookups_total", "Cache lookups by kind and result"),
            &["kind", "result"],
        )
        .map_err(metric_err)?;

        let active_sessions = IntGauge::new("rag_active_sessions", "Live sessions")
            .map_err(metric_err)?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(operation_duration.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(cache_lookups.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(active_sessions.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            registry,
            operations_total,
            operation_duration,
            cache_lookups,
            active_sessions,
            seen_operations: DashSet::new(),
        })
    }

    /// Record one completed operation
    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
        self.seen_operations.insert(operation.to_string());

        if duration > SLOW_OPERATION_THRESHOLD {
            warn!(
                "Slow operation: {} took {:.2}s",
                operation,
                duration.as_secs_f64()
            );
        }
    }

    pub fn record_cache_lookup(&self, kind: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[kind, result]).inc();
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as i64);
    }

    pub fn summary(&self) -> MetricsSummary {
        let mut operations: Vec<OperationSummary> = self
            .seen_operations
            .iter()
            .map(|op| {
                let op = op.key().as_str();
                let success = self.operations_total.with_label_values(&[op, "success"]).get();
                let failure = self.operations_total.with_label_values(&[op, "failure"]).get();
                let histogram = self.operation_duration.with_label_values(&[op]);
                let count = success + failure;
                let samples = histogram.get_sample_count();

                OperationSummary {
                    operation: op.to_string(),
                    count,
                    success_rate: if count == 0 {
                        0.0
                    } else {
                        success as f64 / count as f64
                    },
                    mean_latency_ms: if samples == 0 {
                        0.0
                    } else {
                        histogram.get_sample_sum() * 1000.0 / samples as f64
                    },
                }
            })
            .collect();
        operations.sort_by(|a, b| a.operation.cmp(&b.operation));

        let (mut cache_hits, mut cache_misses) = (0, 0);
        for family in self.cache_lookups_families() {
            for metric in family.get_metric() {
                let is_hit = metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == "result" && l.get_value() == "hit");
                let value = metric.get_counter().get_value() as u64;
                if is_hit {
                    cache_hits += value;
                } else {
                    cache_misses += value;
                }
            }
        }

        MetricsSummary {
            operations,
            cache_hits,
            cache_misses,
            active_sessions: self.active_sessions.get(),
        }
    }

    fn cache_lookups_families(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry
            .gather()
            .into_iter()
            .filter(|f| f.get_name() == "rag_cache_lookups_total")
            .collect()
    }

    /// Prometheus text exposition
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return format!("# Failed to encode metrics: {}\n", e);
        }
        String::from_utf8(buffer).unwrap_or_else(|e| {
            error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        })
    }
}
