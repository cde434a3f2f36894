// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Overlapping text chunker
//!
//! Windows are measured in characters. A window that would cut through a word
//! is pulled back to the last whitespace inside its final 20%, so boundaries
//! land between words whenever the text allows it.

use crate::errors::{EngineError, EngineResult};

/// Share of the window (from its end) searched for a whitespace boundary
const BOUNDARY_SEARCH_FRACTION: f32 = 0.2;

/// One chunk of source text, with character offsets into the original
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> EngineResult<Self> {
        if chunk_size == 0 {
            return Err(EngineError::InvalidInput("chunk size must be > 0".into()));
        }
        if overlap >= chunk_size {
            return Err(EngineError::InvalidInput(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn chunk(&self, text: &str) -> Vec<TextSpan> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut spans = Vec::new();
        let mut start = 0;

        while start < len {
            let mut end = (start + self.chunk_size).min(len);

            if end < len {
                end = self.boundary(&chars, start, end);
            }

            let raw: String = chars[start..end].iter().collect();
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                spans.push(TextSpan {
                    ordinal: spans.len(),
                    start,
                    end,
                    text: trimmed.to_string(),
                });
            }

            if end >= len {
                break;
            }

            let next = end.saturating_sub(self.overlap);
            start = if next > start { next } else { end };
        }

        spans
    }

    /// Pull `end` back to just after the last whitespace in the window's tail
    fn boundary(&self, chars: &[char], start: usize, end: usize) -> usize {
        let search = ((self.chunk_size as f32) * BOUNDARY_SEARCH_FRACTION).ceil() as usize;
        let floor = end.saturating_sub(search).max(start + 1);

        (floor..end)
            .rev()
            .find(|&i| chars[i].is_whitespace())
            .map(|i| i + 1)
            .unwrap_or(end)
    }
}
