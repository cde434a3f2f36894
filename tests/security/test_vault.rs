// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use fabstir_rag_engine::crypto::{CredentialVault, VaultError};
use rand::distributions::{Alphanumeric, DistString};
use rand::{thread_rng, Rng};
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;

fn random_secret(rng: &mut impl Rng, max_len: usize) -> String {
    let len = rng.gen_range(1..=max_len);
    let mut secret = Alphanumeric.sample_string(rng, len);
    if rng.gen_bool(0.3) {
        secret.push_str("-ключ-🔑");
    }
    secret
}

#[tokio::test]
async fn test_round_trip_for_random_secrets() {
    let mut rng = thread_rng();
    let key: [u8; 32] = rng.gen();
    let vault = CredentialVault::in_memory(Some(key));

    for i in 0..64 {
        let backend = format!("backend-{}", i);
        let secret = random_secret(&mut rng, 4096);
        vault
            .store(&backend, SecretString::new(secret.clone()))
            .await
            .unwrap();
        let back = vault.retrieve(&backend).await.unwrap();
        assert_eq!(back.expose_secret(), &secret);
    }
}

#[tokio::test]
async fn test_round_trip_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("credentials.json");
    let mut rng = thread_rng();
    let key: [u8; 32] = rng.gen();
    let secret = random_secret(&mut rng, 512);

    {
        let vault = CredentialVault::open(&path, Some(key)).await.unwrap();
        vault
            .store("claude", SecretString::new(secret.clone()))
            .await
            .unwrap();
    }

    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(!on_disk.contains(&secret));

    let vault = CredentialVault::open(&path, Some(key)).await.unwrap();
    assert_eq!(vault.list().await, vec!["claude".to_string()]);
    assert_eq!(vault.retrieve("claude").await.unwrap().expose_secret(), &secret);

    // Any other key fails authentication instead of yielding garbage
    let mut other = key;
    other[0] ^= 0xff;
    let wrong = CredentialVault::open(&path, Some(other)).await.unwrap();
    assert!(matches!(
        wrong.retrieve("claude").await,
        Err(VaultError::Crypto(_))
    ));
}

#[tokio::test]
async fn test_ciphertext_is_bound_to_backend_name() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("credentials.json");
    let key = [3u8; 32];

    {
        let vault = CredentialVault::open(&path, Some(key)).await.unwrap();
        vault
            .store("openai", SecretString::new("sk-openai".to_string()))
            .await
            .unwrap();
    }

    // Re-label the stored entry under another backend name
    let content = std::fs::read_to_string(&path).unwrap();
    let mut entries: serde_json::Value = serde_json::from_str(&content).unwrap();
    let mut entry = entries["openai"].clone();
    entry["backend"] = serde_json::json!("anthropic");
    entries["anthropic"] = entry;
    std::fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

    let vault = CredentialVault::open(&path, Some(key)).await.unwrap();
    assert!(vault.retrieve("openai").await.is_ok());
    assert!(vault.retrieve("anthropic").await.is_err());
}

#[tokio::test]
async fn test_unknown_backend_is_credential_not_found() {
    let vault = CredentialVault::in_memory(Some([1u8; 32]));
    assert!(matches!(
        vault.retrieve("nobody").await,
        Err(VaultError::CredentialNotFound(name)) if name == "nobody"
    ));
}
