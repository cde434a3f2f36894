// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{engine_with, test_config, ScriptedBackend};
use fabstir_rag_engine::config::QuotaConfig;
use fabstir_rag_engine::session::Role;
use fabstir_rag_engine::{DocumentScope, EngineError, SessionHandle};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_chat_appends_user_and_assistant_turns() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::replying("local", "Paris.");
    let engine = engine_with(test_config(dir.path()), backend.clone()).await;

    let handle = engine.create_session("alice").await.unwrap();
    let reply = engine
        .chat(&handle, "What is the capital of France?")
        .await
        .unwrap();

    assert_eq!(reply.text, "Paris.");
    assert_eq!(reply.backend, "local");
    assert!(!reply.cached);
    assert!(reply.sources.is_empty());

    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[1].role, Role::Assistant);
    assert_eq!(session.title.as_deref(), Some("What is the capital of France?"));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_chat_is_grounded_in_ingested_documents() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::replying("local", "It is stored in the cellar.");
    let engine = engine_with(test_config(dir.path()), backend.clone()).await;

    engine
        .ingest("alice", "wine", "The vintage wine is stored in the cellar below the kitchen.")
        .await
        .unwrap();

    let handle = engine.create_session("alice").await.unwrap();
    let reply = engine.chat(&handle, "Where is the vintage wine stored?").await.unwrap();

    assert!(!reply.sources.is_empty());
    assert_eq!(reply.sources[0].document_id, "wine");

    let prompt = backend.last_prompt().unwrap();
    assert_eq!(prompt.context_chunk_ids, vec![reply.sources[0].chunk_id]);

    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert_eq!(session.messages[1].grounding, vec![reply.sources[0].chunk_id]);
}

#[tokio::test]
async fn test_document_scope_limits_grounding() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::replying("local", "ok");
    let engine = engine_with(test_config(dir.path()), backend).await;

    engine
        .ingest("alice", "garden", "Tomatoes grow best in full sun.")
        .await
        .unwrap();

    let handle = engine.create_session("alice").await.unwrap();
    engine
        .set_documents(&handle, DocumentScope::only(["manual"]))
        .await
        .unwrap();

    // Nothing indexed for the scope: the turn still succeeds, ungrounded
    let reply = engine.chat(&handle, "How do tomatoes grow?").await.unwrap();
    assert!(reply.sources.is_empty());
}

#[tokio::test]
async fn test_failed_completion_leaves_history_untouched() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::failing("local")).await;

    let handle = engine.create_session("bob").await.unwrap();
    let err = engine.chat(&handle, "hello").await.unwrap_err();
    assert!(matches!(err, EngineError::BackendUnavailable { .. }));

    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert!(session.messages.is_empty());
}

#[tokio::test]
async fn test_timed_out_completion_leaves_history_untouched() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::slow("local", Duration::from_secs(5));
    let engine = engine_with(test_config(dir.path()), backend).await;

    let handle = engine.create_session("bob").await.unwrap();
    let err = engine.chat(&handle, "are you there?").await.unwrap_err();
    assert!(matches!(err, EngineError::BackendUnavailable { .. }));

    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert!(session.messages.is_empty());
}

#[tokio::test]
async fn test_chat_rate_limit_surfaces_retry_after() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.rate_limit.operations.insert(
        "chat".to_string(),
        QuotaConfig {
            window_secs: 60,
            max_requests: 2,
        },
    );
    let engine = engine_with(config, ScriptedBackend::replying("local", "ok")).await;

    let handle = engine.create_session("carol").await.unwrap();
    engine.chat(&handle, "one").await.unwrap();
    engine.chat(&handle, "two").await.unwrap();

    match engine.chat(&handle, "three").await {
        Err(EngineError::RateLimitExceeded {
            operation,
            retry_after,
        }) => {
            assert_eq!(operation, "chat");
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected rate limit, got {:?}", other.map(|r| r.text)),
    }

    // A denied turn is never recorded
    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert_eq!(session.messages.len(), 4);
}

#[tokio::test]
async fn test_unknown_handle_is_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;

    let handle = SessionHandle {
        id: "does-not-exist".to_string(),
        identity: "alice".to_string(),
    };
    let err = engine.chat(&handle, "hi").await.unwrap_err();
    assert!(matches!(err, EngineError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_pinning_unknown_backend_is_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;

    let handle = engine.create_session("alice").await.unwrap();
    assert!(engine.set_backend(&handle, Some("local")).await.is_ok());
    let err = engine.set_backend(&handle, Some("gpt-9")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let err = engine.set_template(&handle, Some("pirate")).await.unwrap_err();
    assert!(matches!(err, EngineError::TemplateNotFound(_)));
}

#[tokio::test]
async fn test_input_is_cleaned_and_bounded() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.input.max_message_chars = 100;
    let backend = ScriptedBackend::replying("local", "ok");
    let engine = engine_with(config, backend.clone()).await;
    let handle = engine.create_session("dave").await.unwrap();

    engine.chat(&handle, "  What\0 is\u{1b} Rust?  ").await.unwrap();
    let prompt = backend.last_prompt().unwrap();
    assert_eq!(prompt.turns.last().unwrap().content, "What is Rust?");
    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert_eq!(session.messages[0].content, "What is Rust?");

    let err = engine.chat(&handle, &"x".repeat(101)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert_eq!(backend.calls(), 1);

    // Control characters never reach the index
    engine
        .ingest("dave", "notes", "Bells\u{7}\0 ring at noon.")
        .await
        .unwrap();
    let chunks = engine.retrieval.chunks("notes").await;
    assert_eq!(chunks[0].text, "Bells ring at noon.");
    assert!(engine.ingest("dave", "bad\nid", "text").await.is_err());
}
