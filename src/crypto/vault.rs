// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Credential vault
//!
//! Backend API keys are sealed with AES-256-GCM (AAD = backend name) and kept
//! in a single JSON document keyed by backend name. The key material comes
//! from configuration and is read-only after construction. Plaintext is only
//! ever handed out as a [`SecretString`] for the duration of one call.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::aes_gcm::{open, seal, KEY_LEN, NONCE_LEN};
use super::VaultError;

/// Persisted form of one credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedCredential {
    pub backend: String,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext+tag
    pub ciphertext: String,
    pub stored_at: DateTime<Utc>,
}

pub struct CredentialVault {
    key: Option<[u8; KEY_LEN]>,
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, EncryptedCredential>>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("has_key", &self.key.is_some())
            .field("path", &self.path)
            .finish()
    }
}

impl CredentialVault {
    /// Vault held only in memory
    pub fn in_memory(key: Option<[u8; KEY_LEN]>) -> Self {
        Self {
            key,
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a vault persisted at `path`
    pub async fn open(path: impl AsRef<Path>, key: Option<[u8; KEY_LEN]>) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        let entries = if fs::try_exists(&path).await.unwrap_or(false) {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| VaultError::Storage(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_str::<HashMap<String, EncryptedCredential>>(&content)
                .map_err(|e| VaultError::Storage(format!("parse {}: {}", path.display(), e)))?
        } else {
            HashMap::new()
        };

        info!(
            "Credential vault opened with {} stored credential(s)",
            entries.len()
        );
        Ok(Self {
            key,
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    fn key(&self) -> Result<&[u8; KEY_LEN], VaultError> {
        self.key.as_ref().ok_or(VaultError::KeyUnavailable)
    }

    /// Seal and persist `secret` for `backend`, replacing any previous one
    pub async fn store(&self, backend: &str, secret: SecretString) -> Result<(), VaultError> {
        if backend.trim().is_empty() {
            return Err(VaultError::InvalidBackend(backend.to_string()));
        }
        let key = self.key()?;
        let sealed = seal(secret.expose_secret().as_bytes(), key, backend.as_bytes())?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let entry = EncryptedCredential {
            backend: backend.to_string(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            stored_at: Utc::now(),
        };

        // Memory only changes once the write has landed
        let mut entries = self.entries.write().await;
        let mut updated = entries.clone();
        updated.insert(backend.to_string(), entry);
        self.persist(&updated).await?;
        *entries = updated;
        info!("Stored credential for backend {}", backend);
        Ok(())
    }

    /// Decrypt the credential for `backend`
    pub async fn retrieve(&self, backend: &str) -> Result<SecretString, VaultError> {
        let entry = {
            let entries = self.entries.read().await;
            entries
                .get(backend)
                .cloned()
                .ok_or_else(|| VaultError::CredentialNotFound(backend.to_string()))?
        };
        let key = self.key()?;

        let mut sealed = BASE64
            .decode(&entry.nonce)
            .map_err(|e| VaultError::Storage(format!("bad nonce for {}: {}", backend, e)))?;
        let ciphertext = BASE64
            .decode(&entry.ciphertext)
            .map_err(|e| VaultError::Storage(format!("bad ciphertext for {}: {}", backend, e)))?;
        sealed.extend_from_slice(&ciphertext);

        let plaintext = open(&sealed, key, backend.as_bytes())?;
        let secret = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Crypto("credential is not valid UTF-8".to_string()))?;
        debug!("Credential for backend {} decrypted", backend);
        Ok(SecretString::new(secret))
    }

    pub async fn remove(&self, backend: &str) -> Result<bool, VaultError> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(backend) {
            return Ok(false);
        }
        let mut updated = entries.clone();
        updated.remove(backend);
        self.persist(&updated).await?;
        *entries = updated;
        info!("Removed credential for backend {}", backend);
        Ok(true)
    }

    pub async fn contains(&self, backend: &str) -> bool {
        self.entries.read().await.contains_key(backend)
    }

    /// Backend names with a stored credential, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn persist(&self, entries: &HashMap<String, EncryptedCredential>) -> Result<(), VaultError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VaultError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| VaultError::Storage(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)
            .await
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        Ok(())
    }
}
