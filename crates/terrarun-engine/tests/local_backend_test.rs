// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local process backend against a fake terraform script.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use terrarun_engine::backend::{
    BackendError, CommandOutput, EnvPolicy, ExecOptions, ExecutionBackend, Finalizer,
    LocalBackend, LocalBackendConfig, WorkspaceContext,
};
use terrarun_engine::retry::RetryPolicy;
use tokio::sync::mpsc;
use uuid::Uuid;

const FAKE_TERRAFORM: &str = r#"#!/bin/sh
echo "args: $*"
echo "automation: $TF_IN_AUTOMATION"
if [ "$1" = "fail" ]; then
  echo "Error: boom" >&2
  exit 3
fi
if [ "$1" = "sleep" ]; then
  exec /bin/sleep 30
fi
exit 0
"#;

fn install(binary_dir: &Path, version: &str) {
    let dir = binary_dir.join(version);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("terraform");
    std::fs::write(&path, FAKE_TERRAFORM).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Fixture {
    _dir: TempDir,
    backend: Arc<LocalBackend>,
    workspace: WorkspaceContext,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let binary_dir = dir.path().join("bin");
        install(&binary_dir, "1.5.7");
        install(&binary_dir, "1.10.2");
        // Directory without a binary is not a version.
        std::fs::create_dir_all(binary_dir.join("0.15.0")).unwrap();

        let backend = Arc::new(LocalBackend::new(LocalBackendConfig {
            binary_dir,
            env: EnvPolicy::default(),
            retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(50)),
        }));
        let workspace_id = Uuid::new_v4();
        let workspace = WorkspaceContext {
            workspace_id,
            name: "default".to_string(),
            is_default: true,
            version: "1.5.7".to_string(),
            parallelism: None,
            working_dir: dir.path().join("workspaces").join(workspace_id.to_string()),
            state_path: None,
        };
        Self {
            _dir: dir,
            backend,
            workspace,
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn recording_finalizer() -> (Finalizer, Arc<Mutex<Vec<CommandOutput>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let finalizer: Finalizer = Arc::new(
        move |output: CommandOutput| -> BoxFuture<'static, anyhow::Result<()>> {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(output);
                Ok(())
            })
        },
    );
    (finalizer, seen)
}

#[tokio::test]
async fn test_execute_collects_output_and_exit_code() {
    let fixture = Fixture::new();

    let output = fixture
        .backend
        .execute(
            &fixture.workspace,
            &args(&["show", "-json"]),
            &ExecOptions::default(),
        )
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.output, "args: show -json\nautomation: true");
    assert!(fixture.workspace.working_dir.is_dir());

    let failed = fixture
        .backend
        .execute(&fixture.workspace, &args(&["fail"]), &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(failed.exit_code, 3);
    assert!(failed.output.contains("Error: boom"));
}

#[tokio::test]
async fn test_relative_directories_are_resolved() {
    // `new_in(".")` yields a path relative to the test's working directory.
    let dir = TempDir::new_in(".").unwrap();
    let binary_dir = dir.path().join("bin");
    assert!(binary_dir.is_relative());
    install(&binary_dir, "1.5.7");

    let backend = LocalBackend::new(LocalBackendConfig {
        binary_dir,
        env: EnvPolicy::default(),
        retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(50)),
    });
    assert!(backend.binary_path("1.5.7").is_absolute());

    let workspace_id = Uuid::new_v4();
    let workspace = WorkspaceContext {
        workspace_id,
        name: "default".to_string(),
        is_default: true,
        version: "1.5.7".to_string(),
        parallelism: None,
        working_dir: dir.path().join("workspaces").join(workspace_id.to_string()),
        state_path: None,
    };
    assert!(workspace.working_dir.is_relative());

    let output = backend
        .execute(&workspace, &args(&["init"]), &ExecOptions::default())
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.output, "args: init\nautomation: true");
    assert!(workspace.working_dir.is_dir());
}

#[tokio::test]
async fn test_per_command_env_override() {
    let fixture = Fixture::new();
    let output = fixture
        .backend
        .execute(
            &fixture.workspace,
            &args(&["plan"]),
            &ExecOptions::default().with_env("TF_IN_AUTOMATION", "override"),
        )
        .await
        .unwrap();
    assert!(output.output.ends_with("automation: override"));
}

#[tokio::test]
async fn test_missing_version_is_rejected() {
    let mut fixture = Fixture::new();
    fixture.workspace.version = "9.9.9".to_string();

    let err = fixture
        .backend
        .execute(&fixture.workspace, &args(&["init"]), &ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidVersion(v) if v == "9.9.9"));
}

#[tokio::test]
async fn test_job_streams_lines_and_finalizes() {
    let fixture = Fixture::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (finalizer, seen) = recording_finalizer();

    let outcome = fixture
        .backend
        .run_job(&fixture.workspace, args(&["apply", "plan"]), tx, finalizer)
        .await
        .unwrap();
    assert!(outcome.finalized);
    assert!(outcome.output.success());

    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    assert_eq!(lines, vec!["args: apply plan", "automation: true"]);
    assert_eq!(*seen.lock(), vec![outcome.output.clone()]);
    assert_eq!(fixture.backend.running_jobs(), 0);
}

#[tokio::test]
async fn test_cancel_terminates_job() {
    let fixture = Fixture::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let (finalizer, seen) = recording_finalizer();

    let job = {
        let backend = fixture.backend.clone();
        let workspace = fixture.workspace.clone();
        tokio::spawn(async move {
            backend
                .run_job(&workspace, args(&["sleep"]), tx, finalizer)
                .await
        })
    };

    // The pid is recorded shortly after the job slot; keep signalling until
    // the process goes away.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !job.is_finished() {
            fixture
                .backend
                .cancel_run(&fixture.workspace, false)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let outcome = job.await.unwrap().unwrap();
    assert_eq!(outcome.output.exit_code, -1);
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_cancel_without_job_is_noop() {
    let fixture = Fixture::new();
    fixture
        .backend
        .cancel_run(&fixture.workspace, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_versions_lists_installed_binaries() {
    let fixture = Fixture::new();
    assert_eq!(
        fixture.backend.versions().await.unwrap(),
        vec!["1.10.2".to_string(), "1.5.7".to_string()]
    );
}

#[tokio::test]
async fn test_nothing_survives_restart() {
    let fixture = Fixture::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let (finalizer, seen) = recording_finalizer();

    let outcome = fixture
        .backend
        .resume(&fixture.workspace, tx, finalizer)
        .await
        .unwrap();
    assert!(!outcome.finalized);
    assert!(seen.lock().is_empty());
    assert!(fixture.backend.active_workspaces().await.unwrap().is_empty());
}
