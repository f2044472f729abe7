// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run orchestration.
//!
//! The orchestrator drives a run through its phases while holding the
//! workspace lock:
//!
//! ```text
//! Queued → Initializing → PrePlanning → Planning → PostPlanning → Planned
//!        ↘ Failed                                             ↘ Rejected
//! Planned → Applying → Applied | AppliedStateError | FailedStateError | Failed
//! ```
//!
//! Each long phase runs as a backend job with a finalizer. The finalizer
//! retrieves the new state and commits it together with the phase and run
//! status in one [`ChangeSet`]; the backend retries it until it succeeds, so
//! a state update is never dropped after infrastructure changed.
//!
//! Backend errors (as opposed to non-zero exits) propagate to the caller and
//! leave the run in its last persisted status for recovery to pick up.

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use terrarun_core::models::{
    Apply, ApplyStatus, Plan, PlanStatus, Run, RunStatus, Workspace, WorkspaceSettings,
};
use terrarun_core::persistence::{ChangeSet, Persistence, WorkspaceSync};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    CommandOutput, Finalizer, JobOutcome, LineSender, PlanRequest, TerraformCommands,
    WorkspaceContext,
};
use crate::error::{EngineError, Result};
use crate::lock::{LockRegistry, LockResult, LockTimeout};
use crate::output::{Output, OutputRegistry};
use crate::queue::{RunEvent, RunEventHandler};
use crate::retry::{RetryPolicy, retry_forever};
use crate::state_file::StateStore;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a phase waits for the workspace lock.
    pub lock_timeout: LockTimeout,
    /// Host directory holding one working directory per workspace.
    pub workspaces_root: PathBuf,
    /// Terraform version used when neither the workspace nor its
    /// directories name one.
    pub default_version: Option<String>,
    /// Backoff for finalizers the orchestrator runs itself.
    pub retry: RetryPolicy,
    /// How long a finished plan or apply output stays in the registry for
    /// readers still subscribed to it.
    pub output_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_timeout: LockTimeout::Infinite,
            workspaces_root: PathBuf::from(".data/workspaces"),
            default_version: None,
            retry: RetryPolicy::default(),
            output_retention: Duration::from_secs(60),
        }
    }
}

/// One-shot Terraform commands against a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceCommand {
    /// `show -json` of the saved plan or the state.
    Show {
        /// Show the saved plan instead of the state.
        plan: bool,
    },
    /// `taint <address>`
    Taint {
        /// Resource address.
        address: String,
    },
    /// `untaint <address>`
    Untaint {
        /// Resource address.
        address: String,
    },
    /// `state rm <address>...`
    RemoveResources {
        /// Resource addresses.
        addresses: Vec<String>,
    },
    /// `import <address> <id>`
    Import {
        /// Resource address.
        address: String,
        /// Provider-side ID.
        id: String,
    },
    /// `output -json`
    Outputs,
}

impl WorkspaceCommand {
    /// Command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WorkspaceCommand::Show { .. } => "show",
            WorkspaceCommand::Taint { .. } => "taint",
            WorkspaceCommand::Untaint { .. } => "untaint",
            WorkspaceCommand::RemoveResources { .. } => "remove_resources",
            WorkspaceCommand::Import { .. } => "import",
            WorkspaceCommand::Outputs => "outputs",
        }
    }

    /// Whether a successful run changes the state file.
    pub fn mutates_state(&self) -> bool {
        !matches!(
            self,
            WorkspaceCommand::Show { .. } | WorkspaceCommand::Outputs
        )
    }
}

/// Forget an event once its handler returns.
struct InFlight<'a> {
    set: &'a DashSet<RunEvent>,
    event: RunEvent,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.event);
    }
}

/// Everything a finalizer needs, owned so it can outlive the caller's borrow.
#[derive(Clone)]
struct PhaseContext {
    persistence: Arc<dyn Persistence>,
    state: Arc<dyn StateStore>,
    workspace: WorkspaceContext,
    run_id: Uuid,
}

type FinalizerFuture = BoxFuture<'static, anyhow::Result<()>>;

fn job_output(result: &CommandOutput) -> Option<String> {
    (!result.output.is_empty()).then(|| result.output.clone())
}

impl PhaseContext {
    async fn finalize_plan(
        &self,
        plan_id: Uuid,
        result: CommandOutput,
        post_planning: &AtomicBool,
    ) -> anyhow::Result<()> {
        let output = job_output(&result);
        if !result.success() {
            self.persistence
                .commit(
                    ChangeSet::new()
                        .plan(plan_id, PlanStatus::Failed, output)
                        .run(self.run_id, RunStatus::Failed),
                )
                .await?;
            info!(
                run_id = %self.run_id,
                exit_code = result.exit_code,
                "Plan failed"
            );
            return Ok(());
        }

        if !post_planning.load(Ordering::SeqCst) {
            self.persistence
                .commit(
                    ChangeSet::new()
                        .plan(plan_id, PlanStatus::PostPlanning, None)
                        .run(self.run_id, RunStatus::PostPlanning),
                )
                .await?;
            post_planning.store(true, Ordering::SeqCst);
        }

        let workspace_id = self.workspace.workspace_id;
        let changes = match self.state.retrieve(&self.workspace).await {
            Ok(state) => ChangeSet::new()
                .plan(plan_id, PlanStatus::Planned, output)
                .run(self.run_id, RunStatus::Planned)
                .workspace(WorkspaceSync::synced(workspace_id, state)),
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "State unreadable after plan");
                ChangeSet::new()
                    .plan(plan_id, PlanStatus::Failed, output)
                    .run(self.run_id, RunStatus::Failed)
                    .workspace(WorkspaceSync::failed(workspace_id, e.to_string()))
            }
        };
        self.persistence.commit(changes).await?;
        info!(run_id = %self.run_id, "Plan finished");
        Ok(())
    }

    /// Plan of a destroy retry. The run keeps tracking its apply.
    async fn finalize_replan(&self, plan_id: Uuid, result: CommandOutput) -> anyhow::Result<()> {
        let status = if result.success() {
            PlanStatus::Planned
        } else {
            PlanStatus::Failed
        };
        self.persistence
            .commit(ChangeSet::new().plan(plan_id, status, job_output(&result)))
            .await?;
        Ok(())
    }

    async fn finalize_apply(&self, apply_id: Uuid, result: CommandOutput) -> anyhow::Result<()> {
        let workspace_id = self.workspace.workspace_id;
        let state = match self.state.retrieve(&self.workspace).await {
            Err(e) if e.is_transient() => return Err(e.into()),
            other => other,
        };

        let (status, sync) = match (result.success(), state) {
            (true, Ok(state)) => (
                ApplyStatus::Applied,
                WorkspaceSync::synced(workspace_id, state),
            ),
            (true, Err(e)) => (
                ApplyStatus::AppliedStateError,
                WorkspaceSync::failed(workspace_id, e.to_string()),
            ),
            (false, Ok(state)) => (
                ApplyStatus::Failed,
                WorkspaceSync::synced(workspace_id, state),
            ),
            (false, Err(e)) => (
                ApplyStatus::FailedStateError,
                WorkspaceSync::failed(workspace_id, e.to_string()),
            ),
        };

        self.persistence
            .commit(
                ChangeSet::new()
                    .apply(apply_id, status, job_output(&result))
                    .run(self.run_id, status.into())
                    .workspace(sync),
            )
            .await?;
        info!(
            run_id = %self.run_id,
            exit_code = result.exit_code,
            status = %status,
            "Apply finished"
        );
        Ok(())
    }

    async fn finalize_orphan(&self) -> anyhow::Result<()> {
        let workspace_id = self.workspace.workspace_id;
        let sync = match self.state.retrieve(&self.workspace).await {
            Ok(state) => WorkspaceSync::synced(workspace_id, state),
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => WorkspaceSync::failed(workspace_id, e.to_string()),
        };
        self.persistence
            .commit(ChangeSet::new().workspace(sync))
            .await?;
        Ok(())
    }

    fn plan_finalizer(&self, plan_id: Uuid) -> Finalizer {
        let phase = self.clone();
        let post_planning = Arc::new(AtomicBool::new(false));
        Arc::new(move |result: CommandOutput| -> FinalizerFuture {
            let phase = phase.clone();
            let post_planning = post_planning.clone();
            Box::pin(async move { phase.finalize_plan(plan_id, result, &post_planning).await })
        })
    }

    fn replan_finalizer(&self, plan_id: Uuid) -> Finalizer {
        let phase = self.clone();
        Arc::new(move |result: CommandOutput| -> FinalizerFuture {
            let phase = phase.clone();
            Box::pin(async move { phase.finalize_replan(plan_id, result).await })
        })
    }

    fn apply_finalizer(&self, apply_id: Uuid) -> Finalizer {
        let phase = self.clone();
        Arc::new(move |result: CommandOutput| -> FinalizerFuture {
            let phase = phase.clone();
            Box::pin(async move { phase.finalize_apply(apply_id, result).await })
        })
    }

    fn orphan_finalizer(&self) -> Finalizer {
        let phase = self.clone();
        Arc::new(move |_result: CommandOutput| -> FinalizerFuture {
            let phase = phase.clone();
            Box::pin(async move { phase.finalize_orphan().await })
        })
    }
}

/// Forward job lines into an [`Output`] until the sender is dropped.
fn stream_into(output: Arc<Output>) -> (LineSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            output.add_line(&line);
        }
    });
    (tx, handle)
}

fn add_lines(output: &Output, text: &str) {
    for line in text.lines() {
        output.add_line(line);
    }
}

/// Drives runs through their phases against a backend.
pub struct RunOrchestrator {
    persistence: Arc<dyn Persistence>,
    commands: TerraformCommands,
    state: Arc<dyn StateStore>,
    locks: Arc<LockRegistry>,
    outputs: Arc<OutputRegistry>,
    config: OrchestratorConfig,
    in_flight: DashSet<RunEvent>,
}

impl RunOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        commands: TerraformCommands,
        state: Arc<dyn StateStore>,
        locks: Arc<LockRegistry>,
        outputs: Arc<OutputRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            persistence,
            commands,
            state,
            locks,
            outputs,
            config,
            in_flight: DashSet::new(),
        }
    }

    /// The persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Terraform operations over the configured backend.
    pub fn commands(&self) -> &TerraformCommands {
        &self.commands
    }

    /// Lock registry shared with recovery.
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Live output of plans and applies, keyed by plan/apply ID.
    pub fn outputs(&self) -> &Arc<OutputRegistry> {
        &self.outputs
    }

    /// Process one run event to completion.
    ///
    /// An event identical to one still being handled is ignored.
    pub async fn handle(&self, event: RunEvent) -> Result<()> {
        let Some(_guard) = self.claim(event) else {
            debug!(
                event = event.kind(),
                subject_id = %event.subject_id(),
                "Event already in flight, ignoring duplicate"
            );
            return Ok(());
        };

        match event {
            RunEvent::RunCreated { run_id } => self.plan_run(run_id).await,
            RunEvent::ApplyCreated { run_id } => self.apply_run(run_id).await,
            RunEvent::RunRejected { run_id } => self.reject_run(run_id).await,
            RunEvent::RefreshRequested { workspace_id } => {
                self.refresh_workspace(workspace_id).await
            }
        }
    }

    fn claim(&self, event: RunEvent) -> Option<InFlight<'_>> {
        self.in_flight.insert(event).then(|| InFlight {
            set: &self.in_flight,
            event,
        })
    }

    /// Acquire the workspace lock; [`EngineError::Conflict`] when it is not
    /// granted within `timeout`.
    pub async fn lock_workspace(
        &self,
        workspace_id: Uuid,
        timeout: LockTimeout,
    ) -> Result<LockResult> {
        let lock = self.locks.workspace_lock(workspace_id)?;
        let result = lock.acquire(timeout).await?;
        if !result.acquired_lock() {
            debug!(workspace_id = %workspace_id, "Workspace lock not granted");
            return Err(EngineError::Conflict(workspace_id));
        }
        Ok(result)
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    async fn load_workspace(
        &self,
        workspace_id: Uuid,
    ) -> Result<(Workspace, WorkspaceSettings, WorkspaceContext)> {
        let workspace = self
            .persistence
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workspace", workspace_id))?;
        let settings = self
            .persistence
            .resolve_workspace_settings(workspace_id)
            .await?;
        let context = WorkspaceContext::resolve(
            &workspace,
            &settings,
            self.config.default_version.as_deref(),
            &self.config.workspaces_root,
        )?;
        Ok((workspace, settings, context))
    }

    fn phase(&self, context: &WorkspaceContext, run_id: Uuid) -> PhaseContext {
        PhaseContext {
            persistence: self.persistence.clone(),
            state: self.state.clone(),
            workspace: context.clone(),
            run_id,
        }
    }

    async fn commit_plan(&self, run_id: Uuid, plan_id: Uuid, status: PlanStatus) -> Result<()> {
        self.persistence
            .commit(
                ChangeSet::new()
                    .plan(plan_id, status, None)
                    .run(run_id, status.into()),
            )
            .await?;
        debug!(run_id = %run_id, status = %status, "Plan status updated");
        Ok(())
    }

    async fn commit_apply(&self, run_id: Uuid, apply_id: Uuid, status: ApplyStatus) -> Result<()> {
        self.persistence
            .commit(
                ChangeSet::new()
                    .apply(apply_id, status, None)
                    .run(run_id, status.into()),
            )
            .await?;
        debug!(run_id = %run_id, status = %status, "Apply status updated");
        Ok(())
    }

    /// Finalize a job the backend did not finalize because there was no job
    /// to re-attach to.
    async fn finalize_unattended(&self, finalizer: &Finalizer, outcome: JobOutcome) {
        if outcome.finalized {
            return;
        }
        let output = outcome.output;
        retry_forever(self.config.retry, "finalizer", || finalizer(output.clone())).await;
    }

    // ========================================================================
    // Plan
    // ========================================================================

    async fn plan_run(&self, run_id: Uuid) -> Result<()> {
        let run = self.load_run(run_id).await?;
        let plan = self.persistence.get_plan_for_run(run_id).await?;
        let apply = self.persistence.get_apply_for_run(run_id).await?;
        let fresh = matches!(
            run.status,
            RunStatus::Queued | RunStatus::Initializing | RunStatus::PrePlanning
        ) && plan.is_none_or(|p| p.status.is_unstarted())
            && apply
                .as_ref()
                .is_none_or(|a| a.status == ApplyStatus::Queued);
        if !fresh {
            debug!(run_id = %run_id, status = %run.status, "Run is past planning, skipping");
            return Ok(());
        }

        let confirmed = apply.is_some();
        self.execute_plan(run, false, None).await?;
        if confirmed {
            self.apply_after_plan(run_id).await?;
        }
        Ok(())
    }

    /// Continue a run that was confirmed before it was planned.
    async fn apply_after_plan(&self, run_id: Uuid) -> Result<()> {
        let Some(_guard) = self.claim(RunEvent::ApplyCreated { run_id }) else {
            debug!(run_id = %run_id, "Apply already in flight");
            return Ok(());
        };
        self.apply_run(run_id).await
    }

    async fn execute_plan(&self, run: Run, resume: bool, held: Option<LockResult>) -> Result<()> {
        let plan = self.persistence.create_plan(run.id).await?;
        let output = self.outputs.get_or_add(plan.id);
        let result = self.plan_locked(&run, &plan, &output, resume, held).await;
        output.set_completed();
        self.outputs.retire(&output, self.config.output_retention);
        if let Err(e) = &result {
            warn!(run_id = %run.id, error = %e, "Plan phase aborted");
        }
        result
    }

    async fn plan_locked(
        &self,
        run: &Run,
        plan: &Plan,
        output: &Arc<Output>,
        resume: bool,
        held: Option<LockResult>,
    ) -> Result<()> {
        let _lock = match held {
            Some(lock) => lock,
            None => {
                self.lock_workspace(run.workspace_id, self.config.lock_timeout)
                    .await?
            }
        };
        let (workspace, _settings, context) = self.load_workspace(run.workspace_id).await?;
        info!(
            run_id = %run.id,
            workspace_id = %run.workspace_id,
            resume,
            "Plan phase started"
        );

        if !resume {
            self.commit_plan(run.id, plan.id, PlanStatus::Initializing)
                .await?;
            let init = self.commands.initialize_workspace(&context).await?;
            if !init.success() {
                add_lines(output, &init.output);
                self.persistence
                    .commit(
                        ChangeSet::new()
                            .plan(plan.id, PlanStatus::Failed, Some(init.output))
                            .run(run.id, RunStatus::Failed),
                    )
                    .await?;
                info!(run_id = %run.id, exit_code = init.exit_code, "Workspace initialization failed");
                return Ok(());
            }

            self.commit_plan(run.id, plan.id, PlanStatus::PrePlanning)
                .await?;
            self.state
                .materialize(&context, workspace.state.as_deref())
                .await?;
            self.commit_plan(run.id, plan.id, PlanStatus::Planning)
                .await?;
        }

        let request = PlanRequest {
            destroy: run.is_destroy,
            targets: run.targets.clone(),
            replace_addresses: run.replace_addresses.clone(),
        };
        let finalizer = self.phase(&context, run.id).plan_finalizer(plan.id);
        let (lines, drain) = stream_into(output.clone());
        let outcome = self
            .commands
            .plan(&context, &request, resume, lines, finalizer.clone())
            .await;
        let _ = drain.await;

        self.finalize_unattended(&finalizer, outcome?).await;
        Ok(())
    }

    // ========================================================================
    // Apply
    // ========================================================================

    async fn apply_run(&self, run_id: Uuid) -> Result<()> {
        let run = self.load_run(run_id).await?;
        let plan = self.persistence.get_plan_for_run(run_id).await?;
        let apply = self.persistence.get_apply_for_run(run_id).await?;
        // A queued apply may wait behind its plan; the plan is checked again
        // once the lock is held.
        let ready = match (&plan, &apply) {
            (None, _) => false,
            (Some(_), Some(apply)) => apply.status == ApplyStatus::Queued,
            (Some(plan), None) => plan.status == PlanStatus::Planned,
        };
        if !ready {
            return Err(EngineError::InvalidRunState {
                run_id,
                status: run.status,
                expected: RunStatus::Planned,
            });
        }
        self.execute_apply(run, false, None).await
    }

    async fn execute_apply(&self, run: Run, resume: bool, held: Option<LockResult>) -> Result<()> {
        let apply = self.persistence.create_apply(run.id).await?;
        let output = self.outputs.get_or_add(apply.id);
        let result = self.apply_locked(&run, &apply, &output, resume, held).await;
        output.set_completed();
        self.outputs.retire(&output, self.config.output_retention);
        if let Err(e) = &result {
            warn!(run_id = %run.id, error = %e, "Apply phase aborted");
        }
        result
    }

    async fn apply_locked(
        &self,
        run: &Run,
        apply: &Apply,
        output: &Arc<Output>,
        resume: bool,
        held: Option<LockResult>,
    ) -> Result<()> {
        let _lock = match held {
            Some(lock) => lock,
            None => {
                self.lock_workspace(run.workspace_id, self.config.lock_timeout)
                    .await?
            }
        };
        if !resume {
            self.ensure_planned(run, apply).await?;
        }
        let (workspace, settings, context) = self.load_workspace(run.workspace_id).await?;
        info!(
            run_id = %run.id,
            workspace_id = %run.workspace_id,
            resume,
            "Apply phase started"
        );

        if !resume {
            self.commit_apply(run.id, apply.id, ApplyStatus::Applying)
                .await?;
            if !self.prepare_workspace(run, apply, output, &workspace, &context).await? {
                return Ok(());
            }
        }

        self.apply_job(run, apply, output, &context, resume).await?;

        let threshold = settings.azure_destroy_failure_threshold.unwrap_or(0).max(0);
        let mut attempts = 0;
        while run.is_destroy && attempts < threshold && self.apply_failed(run.id).await? {
            attempts += 1;
            warn!(
                run_id = %run.id,
                attempt = attempts,
                threshold,
                "Destroy apply failed, planning again"
            );
            if !self.replan_destroy(run, output, &context).await? {
                break;
            }
            self.commit_apply(run.id, apply.id, ApplyStatus::Applying)
                .await?;
            self.apply_job(run, apply, output, &context, false).await?;
        }
        Ok(())
    }

    /// Under the lock: the run's plan must be `Planned` for the apply to
    /// start. A plan that ended any other way fails the apply; a plan that
    /// has not started yet leaves it queued.
    async fn ensure_planned(&self, run: &Run, apply: &Apply) -> Result<()> {
        let plan = self.persistence.get_plan_for_run(run.id).await?;
        let status = match plan.map(|p| p.status) {
            Some(PlanStatus::Planned) => return Ok(()),
            None => run.status,
            Some(status) if status.is_unstarted() => status.into(),
            Some(status) => {
                self.commit_apply(run.id, apply.id, ApplyStatus::Failed)
                    .await?;
                warn!(run_id = %run.id, plan_status = %status, "Plan did not succeed, apply failed");
                status.into()
            }
        };
        Err(EngineError::InvalidRunState {
            run_id: run.id,
            status,
            expected: RunStatus::Planned,
        })
    }

    /// Init and state materialization before an apply. `false` when init
    /// failed and the apply was marked failed.
    async fn prepare_workspace(
        &self,
        run: &Run,
        apply: &Apply,
        output: &Output,
        workspace: &Workspace,
        context: &WorkspaceContext,
    ) -> Result<bool> {
        let init = self.commands.initialize_workspace(context).await?;
        if !init.success() {
            add_lines(output, &init.output);
            self.persistence
                .commit(
                    ChangeSet::new()
                        .apply(apply.id, ApplyStatus::Failed, Some(init.output))
                        .run(run.id, RunStatus::Failed),
                )
                .await?;
            info!(run_id = %run.id, exit_code = init.exit_code, "Workspace initialization failed");
            return Ok(false);
        }
        self.state
            .materialize(context, workspace.state.as_deref())
            .await?;
        Ok(true)
    }

    async fn apply_job(
        &self,
        run: &Run,
        apply: &Apply,
        output: &Arc<Output>,
        context: &WorkspaceContext,
        resume: bool,
    ) -> Result<()> {
        let finalizer = self.phase(context, run.id).apply_finalizer(apply.id);
        let (lines, drain) = stream_into(output.clone());
        let outcome = self
            .commands
            .apply(context, resume, lines, finalizer.clone())
            .await;
        let _ = drain.await;
        self.finalize_unattended(&finalizer, outcome?).await;
        Ok(())
    }

    async fn apply_failed(&self, run_id: Uuid) -> Result<bool> {
        let apply = self.persistence.get_apply_for_run(run_id).await?;
        Ok(apply.is_some_and(|a| a.status == ApplyStatus::Failed))
    }

    /// Plan a destroy again after a failed destroy apply. `true` when the
    /// new plan succeeded.
    async fn replan_destroy(
        &self,
        run: &Run,
        output: &Arc<Output>,
        context: &WorkspaceContext,
    ) -> Result<bool> {
        let plan = self.persistence.create_plan(run.id).await?;
        let request = PlanRequest {
            destroy: true,
            targets: run.targets.clone(),
            replace_addresses: run.replace_addresses.clone(),
        };
        let finalizer = self.phase(context, run.id).replan_finalizer(plan.id);
        let (lines, drain) = stream_into(output.clone());
        let outcome = self
            .commands
            .plan(context, &request, false, lines, finalizer.clone())
            .await;
        let _ = drain.await;
        let outcome = outcome?;
        let success = outcome.output.success();
        self.finalize_unattended(&finalizer, outcome).await;
        Ok(success)
    }

    // ========================================================================
    // Reject / refresh / one-shot commands
    // ========================================================================

    async fn reject_run(&self, run_id: Uuid) -> Result<()> {
        let run = self.load_run(run_id).await?;
        let plan = self.persistence.get_plan_for_run(run_id).await?;
        let Some(plan) = plan.filter(|p| p.status == PlanStatus::Planned) else {
            return Err(EngineError::InvalidRunState {
                run_id,
                status: run.status,
                expected: RunStatus::Planned,
            });
        };
        self.commit_plan(run_id, plan.id, PlanStatus::Rejected)
            .await?;
        info!(run_id = %run_id, "Run rejected");
        Ok(())
    }

    async fn refresh_workspace(&self, workspace_id: Uuid) -> Result<()> {
        let _lock = self
            .lock_workspace(workspace_id, self.config.lock_timeout)
            .await?;
        let (workspace, _settings, context) = self.load_workspace(workspace_id).await?;

        let init = self.commands.initialize_workspace(&context).await?;
        let sync = if !init.success() {
            WorkspaceSync::failed(workspace_id, init.output)
        } else {
            self.state
                .materialize(&context, workspace.state.as_deref())
                .await?;
            let refresh = self.commands.refresh(&context).await?;
            if refresh.success() {
                match self.state.retrieve(&context).await {
                    Ok(state) => WorkspaceSync::synced(workspace_id, state),
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => WorkspaceSync::failed(workspace_id, e.to_string()),
                }
            } else {
                WorkspaceSync::failed(workspace_id, refresh.output)
            }
        };

        let failed = sync.sync_errors.is_some();
        self.persistence
            .commit(ChangeSet::new().workspace(sync))
            .await?;
        info!(workspace_id = %workspace_id, failed, "Workspace refreshed");
        Ok(())
    }

    /// Run a one-shot command. Fails with [`EngineError::Conflict`] right
    /// away when the workspace is busy.
    ///
    /// A failed `init` is returned as the command's output.
    pub async fn run_command(
        &self,
        workspace_id: Uuid,
        command: WorkspaceCommand,
    ) -> Result<CommandOutput> {
        let _lock = self
            .lock_workspace(workspace_id, LockTimeout::Immediate)
            .await?;
        let (workspace, _settings, context) = self.load_workspace(workspace_id).await?;

        let init = self.commands.initialize_workspace(&context).await?;
        if !init.success() {
            return Ok(init);
        }
        self.state
            .materialize(&context, workspace.state.as_deref())
            .await?;

        let result = match &command {
            WorkspaceCommand::Show { plan } => self.commands.show(&context, *plan).await?,
            WorkspaceCommand::Taint { address } => self.commands.taint(&context, address).await?,
            WorkspaceCommand::Untaint { address } => {
                self.commands.untaint(&context, address).await?
            }
            WorkspaceCommand::RemoveResources { addresses } => {
                self.commands.remove_resources(&context, addresses).await?
            }
            WorkspaceCommand::Import { address, id } => {
                self.commands.import(&context, address, id).await?
            }
            WorkspaceCommand::Outputs => self.commands.get_outputs(&context).await?,
        };

        if command.mutates_state() && result.success() {
            let state = self.state.retrieve(&context).await?;
            self.persistence
                .commit(ChangeSet::new().workspace(WorkspaceSync::synced(workspace_id, state)))
                .await?;
        }
        info!(
            workspace_id = %workspace_id,
            command = command.name(),
            exit_code = result.exit_code,
            "Workspace command finished"
        );
        Ok(result)
    }

    /// Ask the backend to stop the run's job. Advisory; takes no lock.
    pub async fn cancel_run(&self, run_id: Uuid, force: bool) -> Result<()> {
        let run = self.load_run(run_id).await?;
        let (_workspace, _settings, context) = self.load_workspace(run.workspace_id).await?;
        info!(run_id = %run_id, force, "Cancelling run");
        self.commands.cancel_run(&context, force).await?;
        Ok(())
    }

    // ========================================================================
    // Recovery entry points
    // ========================================================================

    /// Re-attach to the job of a run interrupted mid-phase, holding `lock`.
    pub async fn resume_run(&self, run: Run, lock: LockResult) -> Result<()> {
        let event = match run.status {
            RunStatus::Planning | RunStatus::PostPlanning => RunEvent::RunCreated { run_id: run.id },
            RunStatus::Applying => RunEvent::ApplyCreated { run_id: run.id },
            status => {
                debug!(run_id = %run.id, status = %status, "Nothing to resume");
                return Ok(());
            }
        };
        let Some(_guard) = self.claim(event) else {
            return Ok(());
        };

        match event {
            RunEvent::ApplyCreated { .. } => self.execute_apply(run, true, Some(lock)).await,
            _ => self.execute_plan(run, true, Some(lock)).await,
        }
    }

    /// Re-attach to a job no active run accounts for and persist the state
    /// it left behind, holding `lock`.
    pub async fn reconcile_orphan(&self, workspace_id: Uuid, lock: LockResult) -> Result<()> {
        let (_workspace, _settings, context) = self.load_workspace(workspace_id).await?;
        let finalizer = self.phase(&context, Uuid::nil()).orphan_finalizer();
        let (lines, mut rx) = mpsc::unbounded_channel::<String>();
        let drain = tokio::spawn(async move {
            let mut count = 0usize;
            while rx.recv().await.is_some() {
                count += 1;
            }
            count
        });

        let outcome = self
            .commands
            .resume(&context, lines, finalizer.clone())
            .await;
        let lines_seen = drain.await.unwrap_or_default();
        self.finalize_unattended(&finalizer, outcome?).await;
        drop(lock);

        info!(
            workspace_id = %workspace_id,
            lines_seen,
            "Orphaned job reconciled"
        );
        Ok(())
    }
}

#[async_trait]
impl RunEventHandler for RunOrchestrator {
    async fn handle(&self, event: RunEvent) -> Result<()> {
        RunOrchestrator::handle(self, event).await
    }
}
