// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end runtime tests: queue, dispatcher, scheduler and recovery.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedStateStore, VERSION, fast_retry, wait_until};
use terrarun_core::models::{Plan, PlanStatus, Run, RunStatus, Workspace};
use terrarun_core::persistence::{MemoryPersistence, Persistence};
use terrarun_engine::backend::{MockBackend, MockResponse};
use terrarun_engine::orchestrator::OrchestratorConfig;
use terrarun_engine::queue::RunEvent;
use terrarun_engine::runtime::EngineRuntime;
use uuid::Uuid;

struct Fixture {
    persistence: Arc<MemoryPersistence>,
    backend: Arc<MockBackend>,
    state: Arc<ScriptedStateStore>,
    workspace: Workspace,
}

impl Fixture {
    async fn new() -> Self {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut workspace = Workspace::new(Uuid::new_v4(), "default");
        workspace.terraform_version = Some(VERSION.to_string());
        persistence.insert_workspace(workspace.clone()).await;
        Self {
            persistence,
            backend: Arc::new(MockBackend::new().with_retry(fast_retry())),
            state: Arc::new(ScriptedStateStore::new()),
            workspace,
        }
    }

    fn builder(&self) -> terrarun_engine::runtime::EngineRuntimeBuilder {
        EngineRuntime::builder()
            .persistence(self.persistence.clone())
            .backend(self.backend.clone())
            .state_store(self.state.clone())
            .orchestrator_config(OrchestratorConfig {
                workspaces_root: PathBuf::from("/tmp/terrarun-tests"),
                retry: fast_retry(),
                ..OrchestratorConfig::default()
            })
    }

    async fn status(&self, run_id: Uuid) -> RunStatus {
        self.persistence
            .get_run(run_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

#[tokio::test]
async fn test_builder_requires_backend() {
    let err = EngineRuntime::builder()
        .persistence(Arc::new(MemoryPersistence::new()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("backend is required"));
}

#[tokio::test]
async fn test_queued_event_is_planned() {
    let fixture = Fixture::new().await;
    fixture.state.set_state(r#"{"serial":1}"#);
    let runtime = fixture
        .builder()
        .disable_scheduler()
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());

    let run = Run::new(fixture.workspace.id);
    fixture.persistence.insert_run(run.clone()).await;
    assert!(runtime.queue().add(RunEvent::RunCreated { run_id: run.id }));

    let fixture_ref = &fixture;
    let run_id = run.id;
    wait_until(move || async move { fixture_ref.status(run_id).await == RunStatus::Planned })
        .await;

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scheduler_picks_up_rows_written_elsewhere() {
    let fixture = Fixture::new().await;
    let runtime = fixture
        .builder()
        .scheduler_poll_interval(Duration::from_millis(20))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let run = Run::new(fixture.workspace.id);
    fixture.persistence.insert_run(run.clone()).await;

    let fixture_ref = &fixture;
    let run_id = run.id;
    wait_until(move || async move { fixture_ref.status(run_id).await == RunStatus::Planned })
        .await;
    assert_eq!(fixture.backend.created_jobs(), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_recovers_interrupted_run() {
    let fixture = Fixture::new().await;
    let mut run = Run::new(fixture.workspace.id);
    run.status = RunStatus::PostPlanning;
    let mut plan = Plan::new(run.id);
    plan.status = PlanStatus::PostPlanning;
    fixture.persistence.insert_run(run.clone()).await;
    fixture.persistence.insert_plan(plan).await;
    fixture.backend.seed_active_job(
        fixture.workspace.id,
        "plan",
        MockResponse::success(&["No changes. Your infrastructure matches the configuration."]),
    );

    let runtime = fixture
        .builder()
        .disable_scheduler()
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let report = runtime.wait_for_recovery().await;
    assert_eq!(report.resumed, vec![run.id]);
    assert!(report.failed.is_empty());
    assert_eq!(fixture.status(run.id).await, RunStatus::Planned);
    assert_eq!(fixture.backend.created_jobs(), 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_disables_workspace_locking() {
    let fixture = Fixture::new().await;
    let runtime = fixture
        .builder()
        .disable_scheduler()
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let locks = runtime.locks().clone();
    assert!(locks.is_workspace_locking_enabled());

    runtime.shutdown().await.unwrap();
    assert!(!locks.is_workspace_locking_enabled());
}
