// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Session manager
//!
//! Each session sits behind its own async mutex, so writes to one session are
//! applied strictly in arrival order while different sessions proceed in
//! parallel. The outer map is only touched briefly to look up or remove the
//! per-session slot; no map guard is ever held across an await.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::SessionStore;
use super::{Message, Role, Session, SessionHandle};
use crate::config::SessionConfig;
use crate::errors::{EngineError, EngineResult};
use crate::gateway::estimate_tokens;
use crate::rag::DocumentScope;

/// Per-message framing overhead in tokens
const MESSAGE_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub identity: String,
    pub title: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_messages: usize,
    pub identities: usize,
}

fn message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD
}

/// Newest messages that fit in `max_tokens`, in chronological order
///
/// Older messages are dropped first. The most recent user message is always
/// kept, even when it alone exceeds the budget.
pub fn fit_history(messages: &[Message], max_tokens: usize) -> Vec<Message> {
    let last_user = messages.iter().rposition(|m| m.role == Role::User);
    let mut remaining = max_tokens.saturating_sub(last_user.map_or(0, |i| message_tokens(&messages[i])));

    let mut keep = vec![false; messages.len()];
    if let Some(i) = last_user {
        keep[i] = true;
    }
    for (i, message) in messages.iter().enumerate().rev() {
        if Some(i) == last_user {
            continue;
        }
        let cost = message_tokens(message);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        keep[i] = true;
    }

    messages
        .iter()
        .zip(keep)
        .filter_map(|(m, kept)| kept.then(|| m.clone()))
        .collect()
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    store: Option<Arc<dyn SessionStore>>,
    idle_timeout: Duration,
    max_history_tokens: usize,
}

impl SessionManager {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            store: None,
            idle_timeout: config.idle_timeout(),
            max_history_tokens: config.max_history_tokens,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reload persisted sessions, returning how many were restored
    pub async fn restore(&self) -> EngineResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let sessions = store.load_all().await?;
        let count = sessions.len();
        for session in sessions {
            self.sessions
                .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        }
        info!("Restored {} sessions", count);
        Ok(count)
    }

    pub fn max_history_tokens(&self) -> usize {
        self.max_history_tokens
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn create_session(&self, identity: &str) -> EngineResult<SessionHandle> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(EngineError::InvalidInput(
                "session identity must not be empty".to_string(),
            ));
        }

        let session = Session::new(Uuid::new_v4().to_string(), identity.to_string());
        let handle = session.handle();
        self.persist(&session).await?;
        self.sessions
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));

        info!("Created session {} for {}", handle.id, handle.identity);
        Ok(handle)
    }

    /// Lock a session for exclusive use by its owner
    pub async fn acquire(&self, handle: &SessionHandle) -> EngineResult<OwnedMutexGuard<Session>> {
        let slot = self
            .sessions
            .get(&handle.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::SessionNotFound(handle.id.clone()))?;

        let guard = slot.clone().lock_owned().await;

        // Deleted or evicted while we waited
        let still_live = self
            .sessions
            .get(&handle.id)
            .map_or(false, |entry| Arc::ptr_eq(entry.value(), &slot));
        if !still_live || guard.identity != handle.identity {
            return Err(EngineError::SessionNotFound(handle.id.clone()));
        }
        Ok(guard)
    }

    pub(crate) async fn persist(&self, session: &Session) -> EngineResult<()> {
        if let Some(store) = &self.store {
            store.save(session).await?;
        }
        Ok(())
    }

    /// Apply `change` to a copy, persist the copy, then publish it
    ///
    /// A failed write leaves the in-memory session exactly as it was.
    pub(crate) async fn commit<F>(&self, session: &mut Session, change: F) -> EngineResult<()>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let mut updated = session.clone();
        change(&mut updated);
        self.persist(&updated).await?;
        *session = updated;
        Ok(())
    }

    pub async fn append_message(&self, handle: &SessionHandle, message: Message) -> EngineResult<()> {
        let mut session = self.acquire(handle).await?;
        self.commit(&mut session, |s| s.push(message)).await
    }

    pub async fn get_history(&self, handle: &SessionHandle, max_tokens: usize) -> EngineResult<Vec<Message>> {
        let session = self.acquire(handle).await?;
        Ok(fit_history(&session.messages, max_tokens))
    }

    /// Copy of the full session state
    pub async fn snapshot(&self, handle: &SessionHandle) -> EngineResult<Session> {
        Ok(self.acquire(handle).await?.clone())
    }

    async fn update_settings<F>(&self, handle: &SessionHandle, apply: F) -> EngineResult<()>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let mut session = self.acquire(handle).await?;
        self.commit(&mut session, |s| {
            apply(s);
            s.touch();
        })
        .await
    }

    pub async fn set_backend(&self, handle: &SessionHandle, backend: Option<String>) -> EngineResult<()> {
        self.update_settings(handle, |s| s.settings.backend = backend).await
    }

    pub async fn set_documents(&self, handle: &SessionHandle, documents: DocumentScope) -> EngineResult<()> {
        self.update_settings(handle, |s| s.settings.documents = documents).await
    }

    pub async fn set_template(&self, handle: &SessionHandle, template: Option<String>) -> EngineResult<()> {
        self.update_settings(handle, |s| s.settings.template = template).await
    }

    pub async fn export_markdown(&self, handle: &SessionHandle) -> EngineResult<String> {
        Ok(self.acquire(handle).await?.to_markdown())
    }

    /// Delete a session; returns false when the handle names no owned session
    pub async fn delete(&self, handle: &SessionHandle) -> EngineResult<bool> {
        let owned = match self.acquire(handle).await {
            Ok(guard) => guard,
            Err(EngineError::SessionNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.sessions.remove(&handle.id);
        drop(owned);

        if let Some(store) = &self.store {
            store.delete(&handle.id).await?;
        }
        info!("Deleted session {}", handle.id);
        Ok(true)
    }

    /// Remove sessions idle for longer than the configured timeout
    ///
    /// Sessions that are locked at the moment (a request in flight) are
    /// active by definition and are skipped.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let idle = match chrono::Duration::from_std(self.idle_timeout) {
            Ok(idle) => idle,
            Err(_) => return 0,
        };

        let slots: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = Vec::new();
        for (id, slot) in slots {
            let expired = match slot.try_lock() {
                Ok(session) => now - session.last_activity > idle,
                Err(_) => false,
            };
            if expired && self.sessions.remove_if(&id, |_, v| Arc::ptr_eq(v, &slot)).is_some() {
                evicted.push(id);
            }
        }

        if let Some(store) = &self.store {
            for id in &evicted {
                if let Err(e) = store.delete(id).await {
                    warn!("Failed to delete evicted session {}: {}", id, e);
                }
            }
        }
        if !evicted.is_empty() {
            info!("Evicted {} idle sessions", evicted.len());
        } else {
            debug!("No idle sessions to evict");
        }
        evicted.len()
    }

    fn slots(&self) -> Vec<Arc<Mutex<Session>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Read-only listing, most recently active first
    pub async fn list_sessions(&self, identity: Option<&str>) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for slot in self.slots() {
            let session = slot.lock().await;
            if identity.map_or(true, |id| id == session.identity) {
                summaries.push(SessionSummary {
                    id: session.id.clone(),
                    identity: session.identity.clone(),
                    title: session.title.clone(),
                    message_count: session.messages.len(),
                    created_at: session.created_at,
                    last_activity: session.last_activity,
                });
            }
        }
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub async fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        let mut identities = HashSet::new();
        for slot in self.slots() {
            let session = slot.lock().await;
            stats.active_sessions += 1;
            stats.total_messages += session.messages.len();
            identities.insert(session.identity.clone());
        }
        stats.identities = identities.len();
        stats
    }

    /// Persist every session
    pub async fn flush(&self) -> EngineResult<()> {
        for slot in self.slots() {
            let session = slot.lock().await;
            self.persist(&session).await?;
        }
        Ok(())
    }
}
