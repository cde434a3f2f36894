// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat turn orchestration
//!
//! admit -> retrieve -> render preamble -> complete -> append history.
//! The session stays locked for the whole turn so turns of one session are
//! strictly ordered. Nothing is appended unless the completion succeeds.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::manager::{fit_history, SessionManager};
use super::{InputLimits, Message, Role, SessionHandle};
use crate::errors::{EngineError, EngineResult};
use crate::gateway::{CompletionRequest, ModelGateway, PromptTurn, TemplateStore};
use crate::metrics::MetricsCollector;
use crate::rag::{DocumentScope, RetrievalEngine, RetrievedChunk};
use crate::rate_limit::{OperationKind, RateLimiter};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceRef {
    pub chunk_id: u64,
    pub document_id: String,
    pub ordinal: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub backend: String,
    pub cached: bool,
    /// Chunks that made it into the prompt
    pub sources: Vec<SourceRef>,
}

pub struct ChatPipeline {
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    retrieval: Arc<RetrievalEngine>,
    gateway: Arc<ModelGateway>,
    templates: Arc<TemplateStore>,
    metrics: Arc<MetricsCollector>,
    default_template: String,
    top_k: usize,
    turn_timeout: Duration,
    limits: InputLimits,
}

impl ChatPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        retrieval: Arc<RetrievalEngine>,
        gateway: Arc<ModelGateway>,
        templates: Arc<TemplateStore>,
        metrics: Arc<MetricsCollector>,
        default_template: String,
        top_k: usize,
        turn_timeout: Duration,
        limits: InputLimits,
    ) -> Self {
        Self {
            sessions,
            limiter,
            retrieval,
            gateway,
            templates,
            metrics,
            default_template,
            top_k,
            turn_timeout,
            limits,
        }
    }

    /// Run one chat turn for the session owner
    pub async fn chat(&self, handle: &SessionHandle, text: &str) -> EngineResult<ChatReply> {
        let start = Instant::now();
        let result = self.run_turn(handle, text).await;
        self.metrics.record("chat", start.elapsed(), result.is_ok());
        result
    }

    async fn run_turn(&self, handle: &SessionHandle, text: &str) -> EngineResult<ChatReply> {
        let text = self.limits.message(text)?;
        let text = text.as_str();
        self.limiter.check(&handle.identity, OperationKind::Chat)?;

        let mut session = self.sessions.acquire(handle).await?;
        let settings = session.settings.clone();

        let chunks = self.retrieve_grounding(&settings.documents, text).await?;

        let template = settings
            .template
            .as_deref()
            .unwrap_or(self.default_template.as_str());
        let mut variables = HashMap::new();
        variables.insert("date".to_string(), Utc::now().format("%Y-%m-%d").to_string());
        let preamble = self.templates.render(template, &variables).await?;

        let history: Vec<PromptTurn> = fit_history(&session.messages, self.sessions.max_history_tokens())
            .into_iter()
            .filter(|m| m.role != Role::System)
            .map(|m| PromptTurn::new(m.role, m.content))
            .collect();

        let request = CompletionRequest {
            preamble,
            chunks,
            history,
            user_message: text.to_string(),
        };

        let completion = tokio::time::timeout(
            self.turn_timeout,
            self.gateway.complete(&request, settings.backend.as_deref()),
        )
        .await
        .map_err(|_| EngineError::BackendUnavailable {
            backend: "all".to_string(),
            reason: format!("no reply within {}s", self.turn_timeout.as_secs()),
        })??;

        let sources: Vec<SourceRef> = request
            .chunks
            .iter()
            .filter(|r| completion.context_chunk_ids.contains(&r.chunk.id))
            .map(|r| SourceRef {
                chunk_id: r.chunk.id,
                document_id: r.chunk.document_id.clone(),
                ordinal: r.chunk.ordinal,
                score: r.score,
            })
            .collect();

        let answer = Message::assistant(completion.text.clone(), completion.context_chunk_ids.clone());
        self.sessions
            .commit(&mut session, |s| {
                s.push(Message::user(text));
                s.push(answer);
            })
            .await?;

        info!(
            "Session {} turn answered by {}{} with {} sources",
            handle.id,
            completion.backend,
            if completion.cached { " (cached)" } else { "" },
            sources.len()
        );

        Ok(ChatReply {
            text: completion.text,
            backend: completion.backend,
            cached: completion.cached,
            sources,
        })
    }

    /// Empty grounding when the scope has nothing indexed
    async fn retrieve_grounding(&self, scope: &DocumentScope, text: &str) -> EngineResult<Vec<RetrievedChunk>> {
        match self.retrieval.query(scope, text, self.top_k).await {
            Ok(chunks) => Ok(chunks),
            Err(EngineError::RetrievalUnavailable(reason)) => {
                debug!("Answering without grounding: {}", reason);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Rate-limited document ingestion on behalf of `identity`
    pub async fn ingest(&self, identity: &str, document_id: &str, text: &str) -> EngineResult<usize> {
        let (document_id, text) = self.limits.document(document_id, text)?;
        self.limiter.check(identity, OperationKind::Ingest)?;
        let start = Instant::now();
        let result = self.retrieval.ingest(&document_id, &text).await;
        self.metrics.record("ingest", start.elapsed(), result.is_ok());
        result
    }

    /// Rate-limited similarity search on behalf of `identity`
    pub async fn query(
        &self,
        identity: &str,
        scope: &DocumentScope,
        text: &str,
        k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let text = self.limits.message(text)?;
        self.limiter.check(identity, OperationKind::Query)?;
        let start = Instant::now();
        let result = self.retrieval.query(scope, &text, k).await;
        self.metrics.record("query", start.elapsed(), result.is_ok());
        result
    }
}
