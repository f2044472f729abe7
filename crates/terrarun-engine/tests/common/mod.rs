// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for terrarun-engine integration tests.
//!
//! Provides TestContext wiring an orchestrator over in-memory persistence,
//! the mock backend and a scripted state store.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use terrarun_core::models::{Apply, ApplyStatus, Plan, PlanStatus, Run, RunStatus, Workspace};
use terrarun_core::persistence::{MemoryPersistence, Persistence};
use terrarun_engine::backend::{MockBackend, TerraformCommands, WorkspaceContext};
use terrarun_engine::lock::LockRegistry;
use terrarun_engine::orchestrator::{OrchestratorConfig, RunOrchestrator};
use terrarun_engine::output::OutputRegistry;
use terrarun_engine::retry::RetryPolicy;
use terrarun_engine::state_file::{Result as StateResult, StateError, StateStore};

pub const VERSION: &str = "1.5.7";

/// What the next `retrieve` returns.
#[derive(Debug, Clone)]
pub enum Retrieval {
    State(Option<String>),
    Unavailable,
    Invalid,
}

/// State store that records what was written and replays scripted reads.
#[derive(Debug, Default)]
pub struct ScriptedStateStore {
    materialized: Mutex<Vec<Option<String>>>,
    script: Mutex<VecDeque<Retrieval>>,
    fallback: Mutex<Option<String>>,
}

impl ScriptedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// State returned once the script is exhausted.
    pub fn set_state(&self, state: &str) {
        *self.fallback.lock() = Some(state.to_string());
    }

    pub fn push(&self, retrieval: Retrieval) {
        self.script.lock().push_back(retrieval);
    }

    pub fn materialized(&self) -> Vec<Option<String>> {
        self.materialized.lock().clone()
    }
}

#[async_trait]
impl StateStore for ScriptedStateStore {
    async fn materialize(&self, _workspace: &WorkspaceContext, state: Option<&str>) -> StateResult<()> {
        self.materialized.lock().push(state.map(str::to_string));
        Ok(())
    }

    async fn retrieve(&self, _workspace: &WorkspaceContext) -> StateResult<Option<String>> {
        let next = self.script.lock().pop_front();
        match next {
            Some(Retrieval::State(state)) => Ok(state),
            Some(Retrieval::Unavailable) => Err(StateError::Unavailable(std::io::Error::other(
                "state file busy",
            ))),
            Some(Retrieval::Invalid) => Err(StateError::Invalid("not a state document".into())),
            None => Ok(self.fallback.lock().clone()),
        }
    }
}

/// Test context with one workspace and an orchestrator over it.
pub struct TestContext {
    pub persistence: Arc<MemoryPersistence>,
    pub backend: Arc<MockBackend>,
    pub state: Arc<ScriptedStateStore>,
    pub locks: Arc<LockRegistry>,
    pub outputs: Arc<OutputRegistry>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub workspace: Workspace,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(50))
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_workspace(|_| {}).await
    }

    /// Create a context, adjusting the workspace before it is stored.
    pub async fn with_workspace(configure: impl FnOnce(&mut Workspace)) -> Self {
        let persistence = Arc::new(MemoryPersistence::new());
        let backend = Arc::new(MockBackend::new().with_retry(fast_retry()));
        let state = Arc::new(ScriptedStateStore::new());
        let locks = Arc::new(LockRegistry::new());
        let outputs = Arc::new(OutputRegistry::new());

        let mut workspace = Workspace::new(uuid::Uuid::new_v4(), "default");
        workspace.terraform_version = Some(VERSION.to_string());
        workspace.state = Some(r#"{"serial":1}"#.to_string());
        configure(&mut workspace);
        persistence.insert_workspace(workspace.clone()).await;

        let orchestrator = Arc::new(RunOrchestrator::new(
            persistence.clone(),
            TerraformCommands::new(backend.clone()),
            state.clone(),
            locks.clone(),
            outputs.clone(),
            OrchestratorConfig {
                workspaces_root: PathBuf::from("/tmp/terrarun-tests"),
                retry: fast_retry(),
                ..OrchestratorConfig::default()
            },
        ));

        Self {
            persistence,
            backend,
            state,
            locks,
            outputs,
            orchestrator,
            workspace,
        }
    }

    /// Store a new queued run.
    pub async fn queued_run(&self) -> Run {
        let run = Run::new(self.workspace.id);
        self.persistence.insert_run(run.clone()).await;
        run
    }

    /// Store a run with a plan in `status`.
    pub async fn run_with_plan(&self, status: PlanStatus) -> (Run, Plan) {
        let mut run = Run::new(self.workspace.id);
        run.status = status.into();
        let mut plan = Plan::new(run.id);
        plan.status = status;
        self.persistence.insert_run(run.clone()).await;
        self.persistence.insert_plan(plan.clone()).await;
        (run, plan)
    }

    /// Store a planned run with an apply in `status`.
    pub async fn run_with_apply(&self, status: ApplyStatus) -> (Run, Apply) {
        let (mut run, _) = self.run_with_plan(PlanStatus::Planned).await;
        run.status = status.into();
        self.persistence.insert_run(run.clone()).await;
        let mut apply = Apply::new(run.id);
        apply.status = status;
        self.persistence.insert_apply(apply.clone()).await;
        (run, apply)
    }

    pub async fn run(&self, run_id: uuid::Uuid) -> Run {
        self.persistence.get_run(run_id).await.unwrap().unwrap()
    }

    pub async fn plan(&self, run_id: uuid::Uuid) -> Plan {
        self.persistence
            .get_plan_for_run(run_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn apply(&self, run_id: uuid::Uuid) -> Apply {
        self.persistence
            .get_apply_for_run(run_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn stored_workspace(&self) -> Workspace {
        self.persistence
            .get_workspace(self.workspace.id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Poll until the run reaches `status`.
    pub async fn wait_for_status(&self, run_id: uuid::Uuid, status: RunStatus) {
        wait_until(move || async move { self.run(run_id).await.status == status }).await;
    }
}

/// Poll `check` every few milliseconds, failing the test after five seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
