// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{gateway, MockBackend};
use fabstir_rag_engine::gateway::{BackendError, CompletionRequest};
use fabstir_rag_engine::EngineError;
use secrecy::SecretString;

#[tokio::test]
async fn test_falls_back_when_first_backend_fails() {
    let primary = MockBackend::new("primary", true, Err(BackendError::unavailable("primary", "oom")));
    let backup = MockBackend::new("backup", true, Ok("from backup"));
    let fixture = gateway(vec![primary.clone(), backup.clone()], &["primary", "backup"]);

    let completion = fixture
        .gateway
        .complete(&CompletionRequest::new("hi"), None)
        .await
        .unwrap();

    assert_eq!(completion.backend, "backup");
    assert_eq!(completion.text, "from backup");
    assert_eq!(primary.calls(), 1);
}

#[tokio::test]
async fn test_at_most_one_retry_per_call() {
    let backends: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|name| MockBackend::new(name, true, Err(BackendError::unavailable(name, "down"))))
        .collect();
    let fixture = gateway(backends.clone(), &[]);

    let err = fixture
        .gateway
        .complete(&CompletionRequest::new("hi"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::BackendUnavailable { .. }));
    let invoked: usize = backends.iter().map(|b| b.calls()).sum();
    assert_eq!(invoked, 2);
    assert_eq!(backends[2].calls(), 0);
}

#[tokio::test]
async fn test_unreachable_backend_is_skipped_without_invoking() {
    let dead = MockBackend::unreachable("dead");
    let alive = MockBackend::new("alive", true, Ok("pong"));
    let fixture = gateway(vec![dead.clone(), alive.clone()], &["dead"]);

    let completion = fixture
        .gateway
        .complete(&CompletionRequest::new("ping"), None)
        .await
        .unwrap();

    assert_eq!(completion.backend, "alive");
    assert_eq!(dead.calls(), 0);
    let status = fixture.gateway.status();
    let dead_status = status.iter().find(|s| s.name == "dead").unwrap();
    assert_eq!(dead_status.available, Some(false));
}

#[tokio::test]
async fn test_remote_backend_without_credential_falls_back_to_local() {
    let remote = MockBackend::new("claude", false, Ok("remote answer"));
    let local = MockBackend::new("llama", true, Ok("local answer"));
    let fixture = gateway(vec![remote.clone(), local.clone()], &["claude"]);

    let completion = fixture
        .gateway
        .complete(&CompletionRequest::new("hi"), None)
        .await
        .unwrap();

    assert_eq!(completion.backend, "llama");
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn test_missing_credential_alone_surfaces_as_credential_not_found() {
    let remote = MockBackend::new("claude", false, Ok("remote answer"));
    let fixture = gateway(vec![remote], &[]);

    let err = fixture
        .gateway
        .complete(&CompletionRequest::new("hi"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CredentialNotFound(ref name) if name == "claude"));
}

#[tokio::test]
async fn test_stored_credential_is_handed_to_remote_backend() {
    let remote = MockBackend::new("claude", false, Ok("remote answer"));
    let local = MockBackend::new("llama", true, Ok("local answer"));
    let fixture = gateway(vec![remote.clone(), local.clone()], &[]);
    fixture
        .vault
        .store("claude", SecretString::new("sk-test-123".to_string()))
        .await
        .unwrap();

    let completion = fixture
        .gateway
        .complete(&CompletionRequest::new("hi"), Some("claude"))
        .await
        .unwrap();

    assert_eq!(completion.backend, "claude");
    assert_eq!(remote.seen_credential().as_deref(), Some("sk-test-123"));
    assert_eq!(local.calls(), 0);
}

#[tokio::test]
async fn test_candidate_order_prefers_pin_then_priority_then_local() {
    let fixture = gateway(
        vec![
            MockBackend::new("remote-a", false, Ok("")),
            MockBackend::new("local-a", true, Ok("")),
            MockBackend::new("remote-b", false, Ok("")),
            MockBackend::new("local-b", true, Ok("")),
        ],
        &["remote-b"],
    );

    assert_eq!(
        fixture.gateway.candidate_order(Some("local-b")),
        vec!["local-b", "remote-b", "local-a", "remote-a"]
    );
    assert_eq!(
        fixture.gateway.candidate_order(None),
        vec!["remote-b", "local-a", "local-b", "remote-a"]
    );
}
