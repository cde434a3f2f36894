// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Conversational sessions
//!
//! A session belongs to one caller identity and owns an append-only message
//! list plus its settings (pinned backend, document scope, template). The
//! manager hands out [`SessionHandle`]s; every operation checks that the
//! handle's identity owns the session it names.

pub mod input;
pub mod manager;
pub mod pipeline;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use input::{strip_control, InputLimits};
pub use manager::{fit_history, SessionManager, SessionStats, SessionSummary};
pub use pipeline::{ChatPipeline, ChatReply, SourceRef};
pub use store::{FileSessionStore, SessionStore};

use crate::rag::DocumentScope;

/// Characters of the first user message used as the session title
const TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message, immutable once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Ids of the chunks that grounded an assistant answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding: Vec<u64>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            grounding: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, grounding: Vec<u64>) -> Self {
        Self {
            grounding,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Backend tried first for this session
    pub backend: Option<String>,
    #[serde(default)]
    pub documents: DocumentScope,
    /// Template rendered into the system preamble
    pub template: Option<String>,
}

/// Opaque reference handed to the caller that created a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub identity: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub settings: SessionSettings,
}

impl Session {
    pub fn new(id: String, identity: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            identity,
            title: None,
            messages: Vec::new(),
            created_at: now,
            last_activity: now,
            settings: SessionSettings::default(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            identity: self.identity.clone(),
        }
    }

    pub(crate) fn push(&mut self, message: Message) {
        if self.title.is_none() && message.role == Role::User {
            let title: String = message.content.trim().chars().take(TITLE_CHARS).collect();
            if !title.is_empty() {
                self.title = Some(title);
            }
        }
        self.last_activity = message.timestamp.max(self.last_activity);
        self.messages.push(message);
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# {}\n\n_Session {} started {}_\n",
            self.title.as_deref().unwrap_or("Untitled session"),
            self.id,
            self.created_at.format("%Y-%m-%d %H:%M UTC")
        );
        for message in &self.messages {
            let label = match message.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(&format!(
                "\n## {} ({})\n\n{}\n",
                label,
                message.timestamp.format("%H:%M:%S"),
                message.content.trim_end()
            ));
            if !message.grounding.is_empty() {
                let ids: Vec<String> = message.grounding.iter().map(|id| id.to_string()).collect();
                out.push_str(&format!("\n_Sources: chunks {}_\n", ids.join(", ")));
            }
        }
        out
    }
}
