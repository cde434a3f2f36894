// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! AES-256-GCM sealing for credential material
//!
//! **Sealed Format**:
//! ```text
//! [nonce (12 bytes) | ciphertext+tag (variable length)]
//! ```
//!
//! - Nonce: 12 random bytes, fresh per seal
//! - Tag: 16 bytes, appended by the cipher
//! - AAD: caller supplied (the vault binds each secret to its backend name)

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

use super::VaultError;

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Encrypt `plaintext` under `key`, binding it to `aad`
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("Failed to create AES-GCM cipher: {}", e)))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| VaultError::Crypto(format!("AES-GCM encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a sealed blob produced by [`seal`]
///
/// Fails when the blob is truncated, the key is wrong, the data was tampered
/// with, or the AAD differs from the one used at seal time.
pub fn open(sealed: &[u8], key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Vec<u8>, VaultError> {
    if sealed.len() < NONCE_LEN {
        return Err(VaultError::Crypto(format!(
            "Sealed data too short: expected at least {} bytes for nonce, got {}",
            NONCE_LEN,
            sealed.len()
        )));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("Failed to create AES-GCM cipher: {}", e)))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            VaultError::Crypto(
                "AES-GCM decryption failed (wrong key or corrupted data)".to_string(),
            )
        })
}
