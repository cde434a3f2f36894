// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{engine_with, test_config, ScriptedBackend};
use fabstir_rag_engine::DocumentScope;
use tempfile::TempDir;

#[tokio::test]
async fn test_sessions_and_documents_survive_restart() {
    let dir = TempDir::new().unwrap();

    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "noted")).await;
    engine
        .ingest("alice", "notes", "The meeting moved to Thursday afternoon.")
        .await
        .unwrap();
    let handle = engine.create_session("alice").await.unwrap();
    engine
        .set_documents(&handle, DocumentScope::only(["notes"]))
        .await
        .unwrap();
    engine.chat(&handle, "When is the meeting?").await.unwrap();
    engine.shutdown().await.unwrap();

    let backend = ScriptedBackend::replying("local", "Thursday.");
    let engine = engine_with(test_config(dir.path()), backend.clone()).await;
    assert_eq!(engine.sessions.len(), 1);

    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[1].content, "noted");
    assert_eq!(session.settings.documents, DocumentScope::only(["notes"]));

    // Restored history and index feed the next turn
    let reply = engine.chat(&handle, "Which afternoon?").await.unwrap();
    assert_eq!(reply.sources[0].document_id, "notes");
    let prompt = backend.last_prompt().unwrap();
    assert_eq!(prompt.turns.len(), 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deleted_session_is_not_restored() {
    let dir = TempDir::new().unwrap();

    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;
    let keep = engine.create_session("alice").await.unwrap();
    let drop = engine.create_session("alice").await.unwrap();
    engine.chat(&keep, "hello").await.unwrap();
    engine.chat(&drop, "bye").await.unwrap();
    assert!(engine.delete_session(&drop).await.unwrap());
    engine.shutdown().await.unwrap();

    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "ok")).await;
    assert_eq!(engine.sessions.len(), 1);
    assert!(engine.sessions.snapshot(&keep).await.is_ok());
    assert!(engine.sessions.snapshot(&drop).await.is_err());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_export_markdown_contains_transcript() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(dir.path()), ScriptedBackend::replying("local", "Blue.")).await;

    let handle = engine.create_session("alice").await.unwrap();
    engine.chat(&handle, "What colour is the sky?").await.unwrap();

    let markdown = engine.sessions.export_markdown(&handle).await.unwrap();
    assert!(markdown.starts_with("# What colour is the sky?"));
    assert!(markdown.contains("## User"));
    assert!(markdown.contains("## Assistant"));
    assert!(markdown.contains("Blue."));
}

#[tokio::test]
async fn test_unsaved_turn_is_not_kept_in_history() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let sessions_dir = config.sessions_dir();
    let backend = ScriptedBackend::replying("local", "ok");
    let engine = engine_with(config, backend.clone()).await;
    let handle = engine.create_session("alice").await.unwrap();

    // A regular file where the session directory should be
    std::fs::remove_dir_all(&sessions_dir).unwrap();
    std::fs::write(&sessions_dir, "blocked").unwrap();

    assert!(engine.chat(&handle, "first question").await.is_err());
    assert_eq!(backend.calls(), 1);
    assert!(engine.sessions.snapshot(&handle).await.unwrap().messages.is_empty());

    std::fs::remove_file(&sessions_dir).unwrap();
    engine.chat(&handle, "second question").await.unwrap();

    let session = engine.sessions.snapshot(&handle).await.unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "second question");
    // The failed turn never reached the backend's view of the history
    let prompt = backend.last_prompt().unwrap();
    assert!(prompt.turns.iter().all(|t| t.content != "first question"));
}
