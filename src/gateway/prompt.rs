// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Prompt assembly under a token budget
//!
//! The budget is the backend's context window minus its response reserve.
//! It is spent in a fixed order:
//! 1. the system preamble (truncated only if it alone would not fit)
//! 2. the current user message, always included
//! 3. retrieved chunks in relevance order, capped at a share of what is left;
//!    a chunk that does not fit is dropped and the next one is tried. The
//!    context header and block separators count against that share.
//! 4. conversation history, newest first, until the budget runs out

use serde::Serialize;

use crate::rag::RetrievedChunk;
use crate::session::Role;

/// Rough token estimate (4 bytes per token)
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Per-turn framing overhead in tokens
const TURN_OVERHEAD: usize = 4;

/// Introduces the context blocks; paid once when any chunk is included
const CONTEXT_HEADER: &str =
    "\n\nAnswer using the context below. Cite sources by their bracketed number.\n\n";

const BLOCK_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptTurn {
    pub role: Role,
    pub content: String,
}

impl PromptTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.content) + TURN_OVERHEAD
    }
}

/// Everything the gateway needs to build a prompt for any backend
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub preamble: String,
    /// Sorted by relevance, most relevant first
    pub chunks: Vec<RetrievedChunk>,
    /// Chronological, oldest first, excluding the current user message
    pub history: Vec<PromptTurn>,
    pub user_message: String,
}

impl CompletionRequest {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub system: String,
    /// History turns that fit plus the current user turn, oldest first
    pub turns: Vec<PromptTurn>,
    pub context_chunk_ids: Vec<u64>,
    pub estimated_tokens: usize,
    pub dropped_chunks: usize,
    pub dropped_history: usize,
}

impl AssembledPrompt {
    /// Single-string rendering for completion-style backends
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let label = match turn.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&turn.content);
            out.push_str("\n\n");
        }
        out.push_str("Assistant:");
        out
    }

    /// Whitespace-insensitive form used for cache keys
    pub fn normalized(&self) -> String {
        let full = format!("{}\n{}", self.system, self.render_text());
        full.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PromptAssembler {
    context_share: f32,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self { context_share: 0.6 }
    }
}

impl PromptAssembler {
    pub fn new(context_share: f32) -> Self {
        Self {
            context_share: context_share.clamp(0.0, 1.0),
        }
    }

    pub fn assemble(&self, request: &CompletionRequest, budget: usize) -> AssembledPrompt {
        let user_turn = PromptTurn::new(Role::User, request.user_message.clone());
        let user_tokens = user_turn.tokens();

        let mut preamble = request.preamble.clone();
        let preamble_room = budget.saturating_sub(user_tokens);
        if estimate_tokens(&preamble) > preamble_room {
            preamble = truncate_to_tokens(&preamble, preamble_room);
        }
        let mut remaining = preamble_room.saturating_sub(estimate_tokens(&preamble));

        let chunk_cap = (remaining as f32 * self.context_share) as usize;
        let mut chunk_used = 0;
        let mut context_blocks = Vec::new();
        let mut context_chunk_ids = Vec::new();
        let mut dropped_chunks = 0;

        for retrieved in &request.chunks {
            let block = format!(
                "[{}] (source: {}, part {})\n{}",
                context_blocks.len() + 1,
                retrieved.chunk.document_id,
                retrieved.chunk.ordinal + 1,
                retrieved.chunk.text
            );
            let framing = if context_blocks.is_empty() {
                CONTEXT_HEADER
            } else {
                BLOCK_SEPARATOR
            };
            let cost = estimate_tokens(&block) + estimate_tokens(framing);
            if chunk_used + cost <= chunk_cap {
                chunk_used += cost;
                context_blocks.push(block);
                context_chunk_ids.push(retrieved.chunk.id);
            } else {
                dropped_chunks += 1;
            }
        }
        remaining -= chunk_used;

        let mut kept_history = Vec::new();
        for turn in request.history.iter().rev() {
            let cost = turn.tokens();
            if cost > remaining {
                break;
            }
            remaining -= cost;
            kept_history.push(turn.clone());
        }
        kept_history.reverse();
        let dropped_history = request.history.len() - kept_history.len();

        let mut system = preamble;
        if !context_blocks.is_empty() {
            system.push_str(CONTEXT_HEADER);
            system.push_str(&context_blocks.join(BLOCK_SEPARATOR));
        }

        let mut turns = kept_history;
        turns.push(user_turn);

        let estimated_tokens =
            estimate_tokens(&system) + turns.iter().map(PromptTurn::tokens).sum::<usize>();

        AssembledPrompt {
            system,
            turns,
            context_chunk_ids,
            estimated_tokens,
            dropped_chunks,
            dropped_history,
        }
    }
}

fn truncate_to_tokens(text: &str, tokens: usize) -> String {
    let max_bytes = tokens * 4;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}
