// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{engine_with, test_config, ScriptedBackend};
use fabstir_rag_engine::session::Role;
use fabstir_rag_engine::{EngineError, SessionHandle};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_appending_to_one_session_never_touches_another() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;

    let first = engine.create_session("alice").await.unwrap();
    let second = engine.create_session("bob").await.unwrap();
    assert_ne!(first.id, second.id);

    for i in 0..3 {
        engine.chat(&first, &format!("question {}", i)).await.unwrap();
    }

    let untouched = engine.sessions.snapshot(&second).await.unwrap();
    assert!(untouched.messages.is_empty());
    assert_eq!(
        engine.sessions.snapshot(&first).await.unwrap().messages.len(),
        6
    );
}

#[tokio::test]
async fn test_foreign_identity_cannot_use_a_session() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;

    let owned = engine.create_session("alice").await.unwrap();
    let stolen = SessionHandle {
        id: owned.id.clone(),
        identity: "mallory".to_string(),
    };

    let err = engine.chat(&stolen, "let me in").await.unwrap_err();
    assert!(matches!(err, EngineError::SessionNotFound(_)));
    assert!(!engine.delete_session(&stolen).await.unwrap());
    assert!(engine.sessions.snapshot(&owned).await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_concurrent_turns_on_one_session_are_serialized() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(
        engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await,
    );
    let handle = engine.create_session("alice").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let engine = Arc::clone(&engine);
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            engine.chat(&handle, &format!("turn {}", i)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Every user turn is directly followed by its own answer
    let messages = engine.sessions.snapshot(&handle).await.unwrap().messages;
    assert_eq!(messages.len(), 8);
    for pair in messages.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}

#[tokio::test]
async fn test_sessions_of_different_identities_run_in_parallel() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;

    let a = engine.create_session("alice").await.unwrap();
    let b = engine.create_session("bob").await.unwrap();

    let (ra, rb) = tokio::join!(engine.chat(&a, "from alice"), engine.chat(&b, "from bob"));
    ra.unwrap();
    rb.unwrap();

    let alice = engine.sessions.snapshot(&a).await.unwrap();
    let bob = engine.sessions.snapshot(&b).await.unwrap();
    assert_eq!(alice.messages[0].content, "from alice");
    assert_eq!(bob.messages[0].content, "from bob");
    assert_eq!(engine.sessions.list_sessions(Some("alice")).await.len(), 1);
}
