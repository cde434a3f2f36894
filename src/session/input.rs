// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Caller input cleanup
//!
//! Chat messages and ingested documents often come from pasted text or
//! extracted PDFs. NUL bytes and other C0 control characters are removed
//! before anything is embedded, cached or sent to a backend. Size limits are
//! enforced here so oversized input is rejected before any work is done.

use serde::Deserialize;

use crate::errors::{EngineError, EngineResult};

/// Longest document id accepted, in characters
pub const MAX_DOCUMENT_ID_CHARS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    /// Longest chat message, in characters
    pub max_message_chars: usize,
    /// Largest document accepted for ingestion, in bytes
    pub max_document_bytes: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_message_chars: 5000,
            max_document_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Drop NUL and C0 control characters, keeping tab, newline and CR
pub fn strip_control(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\0' && (*c >= ' ' || *c == '\t' || *c == '\n' || *c == '\r') && *c != '\u{7f}')
        .collect()
}

impl InputLimits {
    /// Cleaned chat message, or `InvalidInput` when empty or too long
    pub fn message(&self, text: &str) -> EngineResult<String> {
        let cleaned = strip_control(text);
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return Err(EngineError::InvalidInput("message must not be empty".to_string()));
        }
        let chars = cleaned.chars().count();
        if chars > self.max_message_chars {
            return Err(EngineError::InvalidInput(format!(
                "message is {} characters, limit is {}",
                chars, self.max_message_chars
            )));
        }
        Ok(cleaned.to_string())
    }

    /// Cleaned `(document_id, text)` pair for ingestion
    pub fn document(&self, document_id: &str, text: &str) -> EngineResult<(String, String)> {
        let id = document_id.trim();
        if id.is_empty() {
            return Err(EngineError::InvalidInput("document id must not be empty".to_string()));
        }
        if id.chars().any(char::is_control) {
            return Err(EngineError::InvalidInput(
                "document id must not contain control characters".to_string(),
            ));
        }
        if id.chars().count() > MAX_DOCUMENT_ID_CHARS {
            return Err(EngineError::InvalidInput(format!(
                "document id is longer than {} characters",
                MAX_DOCUMENT_ID_CHARS
            )));
        }
        if text.len() > self.max_document_bytes {
            return Err(EngineError::InvalidInput(format!(
                "document {} is {} bytes, limit is {}",
                id,
                text.len(),
                self.max_document_bytes
            )));
        }
        Ok((id.to_string(), strip_control(text)))
    }
}
