// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use fabstir_rag_engine::config::EngineConfig;
use fabstir_rag_engine::{EngineContext, EngineError};
use secrecy::{Secret, SecretString};
use tempfile::TempDir;

async fn engine(dir: &TempDir, password: Option<&str>) -> EngineContext {
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.admin_password = password.map(|p| Secret::new(p.to_string()));
    config.encryption_key = Some(Secret::new(
        "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string(),
    ));
    EngineContext::initialize_with_backends(config, Vec::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_wrong_password_is_denied() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Some("correct horse")).await;

    assert!(matches!(
        engine.admin.authenticate("battery staple"),
        Err(EngineError::AdminAccessDenied)
    ));
    assert!(engine.admin.authenticate("correct horse").is_ok());
}

#[tokio::test]
async fn test_admin_disabled_without_password() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, None).await;

    assert!(!engine.admin.is_enabled());
    assert!(engine.admin.authenticate("").is_err());
    assert!(engine.admin.authenticate("anything").is_err());
}

#[tokio::test]
async fn test_stats_report_names_but_never_secrets() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Some("pw")).await;

    engine
        .store_credential("anthropic", SecretString::new("sk-ant-secret".to_string()))
        .await
        .unwrap();
    engine.create_session("alice").await.unwrap();
    engine.create_session("bob").await.unwrap();

    let token = engine.admin.authenticate("pw").unwrap();
    let stats = engine.admin.system_stats(&token).await.unwrap();
    assert_eq!(stats.sessions.active_sessions, 2);
    assert_eq!(stats.sessions.identities, 2);
    assert_eq!(stats.stored_credentials, 1);

    assert_eq!(
        engine.admin.list_credentials(&token).await.unwrap(),
        vec!["anthropic".to_string()]
    );

    let rendered = serde_json::to_string(&stats).unwrap();
    assert!(!rendered.contains("sk-ant-secret"));
    let metrics = engine.admin.metrics_text(&token).unwrap();
    assert!(!metrics.contains("sk-ant-secret"));
}
