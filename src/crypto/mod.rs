// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Credential protection
//!
//! - **aes_gcm**: AES-256-GCM seal/open with caller supplied AAD
//! - **vault**: encrypted-at-rest store of backend API keys
//!
//! ## Security Considerations
//!
//! - The vault key is supplied by configuration, never derived from user input
//! - Plaintext credentials are never persisted or logged
//! - Each credential is bound to its backend name through the AAD

pub mod aes_gcm;
pub mod vault;

use thiserror::Error;

pub use vault::{CredentialVault, EncryptedCredential};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No credential stored for backend: {0}")]
    CredentialNotFound(String),

    #[error("Vault key material is not configured")]
    KeyUnavailable,

    #[error("Invalid backend name: {0:?}")]
    InvalidBackend(String),

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error("Vault storage error: {0}")]
    Storage(String),
}
