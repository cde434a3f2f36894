// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::Session;
use crate::errors::{EngineError, EngineResult};

/// Trait for session persistence backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save (create or replace) a session
    async fn save(&self, session: &Session) -> EngineResult<()>;

    /// Load every persisted session
    async fn load_all(&self) -> EngineResult<Vec<Session>>;

    /// Delete a session; missing sessions are not an error
    async fn delete(&self, session_id: &str) -> EngineResult<()>;
}

/// One JSON file per session id
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, session_id: &str) -> EngineResult<PathBuf> {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(EngineError::InvalidInput(format!(
                "invalid session id {:?}",
                session_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &Session) -> EngineResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.session_path(&session.id)?;
        let json = serde_json::to_vec_pretty(session)?;

        // Write atomically using a temp file
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        fs::rename(temp_path, path).await?;
        Ok(())
    }

    async fn load_all(&self) -> EngineResult<Vec<Session>> {
        if !fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .await
                .map_err(EngineError::from)
                .and_then(|content| serde_json::from_str::<Session>(&content).map_err(EngineError::from));
            match parsed {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session file {:?}: {}", path, e),
            }
        }
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> EngineResult<()> {
        let path = self.session_path(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
