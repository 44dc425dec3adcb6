//! Sandbox integration tests.
//!
//! Tests the full pipeline: Sandbox facade → Dispatcher → LifecycleManager →
//! ContainerEngine (MockEngine). These tests do NOT require Docker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use devbox_core::mocks::InMemoryFileStore;
use devbox_core::{FileStore, SandboxConfig};
use devbox_sandbox::engine::ExecCall;
use devbox_sandbox::{
    choose_backend, ContainerEngine, ContainerSandbox, ContainerStatus, ExecOutput,
    ExecutionRequest, FailureKind, LifecycleManager, MockEngine, Sandbox, SandboxRequest, Stage,
};

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> SandboxConfig {
    SandboxConfig {
        metrics_sample_rate: 0.0,
        ..SandboxConfig::default()
    }
}

fn sandbox(engine: Arc<MockEngine>, files: InMemoryFileStore) -> ContainerSandbox {
    ContainerSandbox::new(engine, test_config(), Arc::new(files))
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn commands(calls: &[ExecCall]) -> Vec<String> {
    calls.iter().map(|c| c.argv.join(" ")).collect()
}

// =============================================================================
// 1. Concurrent requests share one container
// =============================================================================

#[tokio::test]
async fn test_concurrent_file_runs_create_one_container() {
    let engine = Arc::new(MockEngine::new().with_create_delay(Duration::from_millis(25)));
    let files = InMemoryFileStore::new().with_file("ws", "main.py", "print(1)");
    let sandbox = Arc::new(sandbox(engine.clone(), files));

    let runs: Vec<_> = (0..6)
        .map(|_| {
            let sandbox = sandbox.clone();
            tokio::spawn(async move { sandbox.execute_file("main.py", "ws", None).await })
        })
        .collect();

    for run in runs {
        assert!(run.await.unwrap().success);
    }

    assert_eq!(engine.create_calls(), 1);
    assert_eq!(engine.container_names(), vec!["devbox-ws-ws".to_string()]);
    let running: Vec<_> = sandbox
        .lifecycle()
        .records()
        .into_iter()
        .filter(|r| r.status == ContainerStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);
}

#[tokio::test]
async fn test_workspaces_are_isolated() {
    let engine = Arc::new(MockEngine::new());
    let sandbox = sandbox(engine.clone(), InMemoryFileStore::new());

    sandbox.execute_command_argv(&argv(&["true"]), "alpha").await;
    sandbox.execute_command_argv(&argv(&["true"]), "beta").await;

    assert_eq!(
        engine.container_names(),
        vec!["devbox-ws-alpha".to_string(), "devbox-ws-beta".to_string()]
    );
    let containers: Vec<_> = engine.exec_calls().into_iter().map(|c| c.container).collect();
    assert_eq!(containers, vec!["devbox-ws-alpha", "devbox-ws-beta"]);
}

// =============================================================================
// 2. Staged execution
// =============================================================================

#[tokio::test]
async fn test_compile_error_surfaces_diagnostics_verbatim() {
    let diagnostics = "src/main.rs:2:5: error[E0425]: cannot find value `x`";
    let engine = Arc::new(MockEngine::new().with_responder(move |_, argv| {
        if argv[0] == "rustc" {
            ExecOutput::failed(1, diagnostics)
        } else {
            ExecOutput::ok("")
        }
    }));
    let files = InMemoryFileStore::new().with_file("ws", "src/main.rs", "fn main() { x }");
    let sandbox = sandbox(engine.clone(), files);

    let outcome = sandbox.execute_file("src/main.rs", "ws", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::CompilationFailure));
    assert_eq!(outcome.output, diagnostics);
    assert_eq!(outcome.language.as_deref(), Some("rust"));
    assert_eq!(outcome.stages.len(), 1);
    assert_eq!(outcome.stages[0].stage, Stage::Compilation);
    assert!(!commands(&engine.exec_calls())
        .iter()
        .any(|c| c == "/tmp/devbox-build/ws/rust/src_main"));
}

#[tokio::test]
async fn test_unrecognized_file_lists_supported_languages() {
    let engine = Arc::new(MockEngine::new());
    let files = InMemoryFileStore::new().with_file("ws", "data.bin", "\u{0}\u{1}");
    let sandbox = sandbox(engine.clone(), files);

    let outcome = sandbox.execute_file("data.bin", "ws", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::UnsupportedLanguage));
    assert_eq!(outcome.stages.len(), 1);
    assert_eq!(outcome.stages[0].stage, Stage::Detection);
    let message = outcome.error.unwrap();
    for language in ["python", "go", "java"] {
        assert!(message.contains(language), "{}", message);
    }
    assert!(engine.exec_calls().is_empty());
}

#[tokio::test]
async fn test_hint_overrides_extension() {
    let engine = Arc::new(MockEngine::new());
    let sandbox = sandbox(engine.clone(), InMemoryFileStore::new());

    let outcome = sandbox.execute_file("script.txt", "ws", Some("ruby")).await;

    assert!(outcome.success);
    assert_eq!(outcome.language.as_deref(), Some("ruby"));
    assert_eq!(
        commands(&engine.exec_calls()).last().map(String::as_str),
        Some("ruby /workspace/script.txt")
    );
}

#[tokio::test]
async fn test_bootstrap_runs_before_file() {
    let engine = Arc::new(MockEngine::new());
    let files = InMemoryFileStore::new()
        .with_file("ws", "Gemfile", "source 'https://rubygems.org'")
        .with_file("ws", "app.rb", "puts 1");
    let sandbox = sandbox(engine.clone(), files);

    let outcome = sandbox
        .execute_with_bootstrap(&ExecutionRequest::new("ws", "app.rb"))
        .await;

    assert!(outcome.success);
    assert_eq!(
        commands(&engine.exec_calls()),
        vec![
            "bundle install --path vendor/bundle",
            "which ruby",
            "ruby /workspace/app.rb"
        ]
    );
}

// =============================================================================
// 3. Shell vs argv
// =============================================================================

#[tokio::test]
async fn test_argv_keeps_metacharacters_literal() {
    let engine = Arc::new(MockEngine::new());
    let sandbox = sandbox(engine.clone(), InMemoryFileStore::new());

    let result = sandbox
        .execute_command_argv(&argv(&["echo", "a b; rm -rf /"]), "ws")
        .await;

    assert!(result.success);
    assert_eq!(result.output, "a b; rm -rf /\n");
    let calls = engine.exec_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].argv, argv(&["echo", "a b; rm -rf /"]));
}

// =============================================================================
// 4. Restart reconciliation and idle reclamation
// =============================================================================

#[tokio::test]
async fn test_reconcile_after_restart() {
    let engine = Arc::new(MockEngine::new());

    // First process lifetime.
    let before = LifecycleManager::new(engine.clone(), test_config());
    before
        .get_or_create(&SandboxRequest::new("running", "python"))
        .await
        .unwrap();
    before
        .get_or_create(&SandboxRequest::new("stopped", "node"))
        .await
        .unwrap();
    before.stop("stopped").await.unwrap();
    engine.seed_container("someone-elses-db", ContainerStatus::Running, HashMap::new());
    drop(before);

    // Fresh process, empty registry.
    let after = LifecycleManager::new(engine.clone(), test_config());
    assert!(after.records().is_empty());
    assert_eq!(after.reconcile().await.unwrap(), 2);

    let running = after.status("running").unwrap();
    assert_eq!(running.status, ContainerStatus::Running);
    assert_eq!(running.runtime, "python");
    let stopped = after.status("stopped").unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.runtime, "node");

    // Using the stopped workspace restarts its container instead of creating one.
    let created_before = engine.create_calls();
    let result = after.exec_in("stopped", &argv(&["true"]), "node").await;
    assert!(result.success);
    assert_eq!(engine.create_calls(), created_before);
    assert_eq!(engine.status_of("devbox-ws-stopped"), Some(ContainerStatus::Running));
}

#[tokio::test]
async fn test_zero_ttl_sweep_reclaims_everything_idle() {
    let engine = Arc::new(MockEngine::new());
    let config = SandboxConfig {
        idle_ttl_secs: 0,
        ..test_config()
    };
    let manager = LifecycleManager::new(engine.clone(), config);
    for ws in ["a", "b"] {
        manager
            .get_or_create(&SandboxRequest::new(ws, "generic"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut reclaimed = manager.sweep_idle().await;
    reclaimed.sort();

    assert_eq!(reclaimed, vec!["a".to_string(), "b".to_string()]);
    assert!(engine.container_names().is_empty());
}

// =============================================================================
// 5. Backend selection
// =============================================================================

#[tokio::test]
async fn test_simulated_fallback_never_touches_engine() {
    let engine = Arc::new(MockEngine::new());
    engine.set_available(false);
    let files: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());

    let sandbox = choose_backend(
        &test_config(),
        Ok(engine.clone() as Arc<dyn ContainerEngine>),
        files,
    )
    .await
    .unwrap();
    sandbox.initialize().await.unwrap();

    let result = sandbox
        .install_packages(&argv(&["left-pad"]), "npm", "ws")
        .await;
    assert!(result.success);
    assert!(result.output.contains("left-pad"));

    let outcome = sandbox.execute_file("main.c", "ws", None).await;
    assert!(outcome.success);

    sandbox.shutdown().await.unwrap();
    assert_eq!(engine.create_calls(), 0);
    assert!(engine.exec_calls().is_empty());
}
