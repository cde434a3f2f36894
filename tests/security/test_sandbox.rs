// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use fabstir_rag_engine::config::{EngineConfig, QuotaConfig, SandboxConfig};
use fabstir_rag_engine::sandbox::SandboxError;
use fabstir_rag_engine::{CodeSandbox, EngineContext, EngineError, Violation};
use std::time::Duration;
use tempfile::TempDir;

fn sandbox_with(interpreter: &str) -> CodeSandbox {
    let config = SandboxConfig {
        interpreter: interpreter.to_string(),
        interpreter_args: Vec::new(),
        ..SandboxConfig::default()
    };
    CodeSandbox::new(&config, true)
}

#[tokio::test]
async fn test_filesystem_call_is_rejected_before_running() {
    // Spawning this interpreter would fail, so reaching it shows up as an
    // execution error rather than a violation
    let sandbox = sandbox_with("/nonexistent/python3");
    let source = "data = open('/etc/passwd').read()\nprint(data)\n";

    let violations = sandbox.validate(source);
    assert_eq!(
        violations,
        vec![Violation::DeniedBuiltin {
            name: "open".to_string(),
            line: 1
        }]
    );

    match sandbox.execute(source, None).await {
        Err(SandboxError::SecurityViolation(found)) => assert_eq!(found, violations),
        other => panic!("expected a security violation, got {:?}", other.map(|o| o.stdout)),
    }
}

#[tokio::test]
async fn test_code_hidden_in_fstring_is_rejected_before_running() {
    let sandbox = sandbox_with("/nonexistent/python3");
    let source = "print(f\"{open('/etc/passwd').read()}\")\n";

    match sandbox.execute(source, None).await {
        Err(SandboxError::SecurityViolation(found)) => assert_eq!(
            found,
            vec![Violation::DeniedBuiltin {
                name: "open".to_string(),
                line: 1
            }]
        ),
        other => panic!("expected a security violation, got {:?}", other.map(|o| o.stdout)),
    }
}

#[tokio::test]
async fn test_fullwidth_builtin_is_rejected_before_running() {
    let sandbox = sandbox_with("/nonexistent/python3");
    let source = "print(\u{ff4f}\u{ff50}\u{ff45}\u{ff4e}('/etc/passwd').read())\n";

    match sandbox.execute(source, None).await {
        Err(SandboxError::SecurityViolation(found)) => {
            assert!(matches!(found.as_slice(), [Violation::Syntax { line: 1, .. }]));
        }
        other => panic!("expected a security violation, got {:?}", other.map(|o| o.stdout)),
    }
}

#[tokio::test]
async fn test_clean_code_reaches_the_interpreter() {
    let sandbox = sandbox_with("/nonexistent/python3");
    let result = sandbox.execute("print(1 + 1)\n", None).await;
    assert!(matches!(result, Err(SandboxError::Execution(_))));
}

#[tokio::test]
async fn test_every_violation_is_reported() {
    let sandbox = sandbox_with("/bin/sh");
    let source = "import os\nimport subprocess as sp\nx = ().__class__.__bases__\nwhile True:\n    pass\n";

    let violations = sandbox.validate(source);
    assert!(violations.contains(&Violation::DeniedImport {
        module: "os".to_string(),
        line: 1
    }));
    assert!(violations.contains(&Violation::DeniedImport {
        module: "subprocess".to_string(),
        line: 2
    }));
    assert!(violations
        .iter()
        .any(|v| matches!(v, Violation::DeniedAttribute { line: 3, .. })));
    assert!(violations.contains(&Violation::UnboundedLoop { line: 4 }));
}

#[tokio::test]
async fn test_runaway_process_is_killed() {
    let sandbox = sandbox_with("/bin/sh");
    let started = std::time::Instant::now();
    let result = sandbox
        .execute("sleep 5\n", Some(Duration::from_millis(200)))
        .await;

    assert!(matches!(result, Err(SandboxError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(4));
}

fn engine_config(dir: &TempDir, enabled: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.code_execution_enabled = enabled;
    config.sandbox.interpreter = "/bin/sh".to_string();
    config.sandbox.interpreter_args = Vec::new();
    config.rate_limit.operations.insert(
        "execute".to_string(),
        QuotaConfig {
            window_secs: 60,
            max_requests: 2,
        },
    );
    config
}

#[tokio::test]
async fn test_engine_execution_is_disabled_by_default_flag() {
    let dir = TempDir::new().unwrap();
    let engine = EngineContext::initialize_with_backends(engine_config(&dir, false), Vec::new())
        .await
        .unwrap();

    let err = engine.execute_code("alice", "echo hi\n", None).await.unwrap_err();
    assert!(matches!(err, EngineError::ExecutionDisabled));
}

#[tokio::test]
async fn test_engine_execution_is_validated_and_rate_limited() {
    let dir = TempDir::new().unwrap();
    let engine = EngineContext::initialize_with_backends(engine_config(&dir, true), Vec::new())
        .await
        .unwrap();

    let output = engine.execute_code("alice", "echo hi\n", None).await.unwrap();
    assert_eq!(output.stdout, "hi\n");
    assert_eq!(output.exit_code, Some(0));

    match engine.execute_code("alice", "import os\n", None).await {
        Err(EngineError::SecurityViolation { violations }) => {
            assert_eq!(violations, vec!["line 1: import of restricted module 'os'".to_string()]);
        }
        other => panic!("expected a security violation, got {:?}", other.map(|o| o.stdout)),
    }

    let err = engine.execute_code("alice", "echo again\n", None).await.unwrap_err();
    assert!(matches!(err, EngineError::RateLimitExceeded { .. }));
    assert!(engine.execute_code("bob", "echo hi\n", None).await.is_ok());
}
