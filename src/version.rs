// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the Fabstir RAG engine

/// Full version string with feature description
pub const VERSION: &str = "v0.1.0-rag-engine-2025-11-03";

/// Semantic version number
pub const VERSION_NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Build date
pub const BUILD_DATE: &str = "2025-11-03";

/// Supported features in this version
pub const FEATURES: &[&str] = &[
    "multi-session",
    "document-retrieval",
    "hnsw-index",
    "backend-failover",
    "ollama",
    "openai-compatible",
    "anthropic",
    "prompt-templates",
    "response-cache",
    "rate-limiting",
    "encrypted-credentials",
    "code-sandbox",
    "prometheus-metrics",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("Fabstir RAG Engine {} ({})", VERSION_NUMBER, BUILD_DATE)
}

/// Get full version info for status output
pub fn get_version_info() -> serde_json::Value {
    serde_json::json!({
        "version": VERSION_NUMBER,
        "build": VERSION,
        "date": BUILD_DATE,
        "features": FEATURES,
    })
}
