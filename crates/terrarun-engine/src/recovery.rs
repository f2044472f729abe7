// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup recovery.
//!
//! Runs once before the queue dispatcher starts and reconciles what the
//! backend is still running with what persistence says is in progress:
//!
//! 1. Sweep one-shot command leftovers, then ask the backend which
//!    workspaces have a live job
//! 2. Load every run in an active status
//! 3. Re-dispatch runs that never started a job; re-attach to runs that did
//! 4. For live jobs no active run accounts for, re-attach and persist the
//!    state they left behind
//!
//! Locks for re-attached runs and orphans are taken here, with a zero
//! timeout, before anything else can ask for them. A failure for one
//! workspace is logged and never stops the others.

use std::collections::HashSet;
use std::sync::Arc;
use terrarun_core::models::{Run, RunStatus};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::lock::LockTimeout;
use crate::orchestrator::RunOrchestrator;
use crate::queue::{RunEvent, RunQueue};

/// What a recovery pass did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Runs re-attached to their job.
    pub resumed: Vec<Uuid>,
    /// Runs put back on the queue.
    pub redispatched: Vec<Uuid>,
    /// Workspaces whose orphaned job is being reconciled.
    pub orphans_reconciled: Vec<Uuid>,
    /// Runs or workspaces left alone because their lock was taken.
    pub skipped: Vec<Uuid>,
    /// Runs or workspaces whose recovery failed.
    pub failed: Vec<Uuid>,
    /// One-shot command leftovers removed before recovery.
    pub leftovers_removed: usize,
    tasks: Vec<(Uuid, JoinHandle<Result<()>>)>,
}

impl RecoveryReport {
    /// Whether background recovery tasks are still outstanding.
    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Copy of the report without its task handles.
    pub fn summary(&self) -> RecoveryReport {
        RecoveryReport {
            resumed: self.resumed.clone(),
            redispatched: self.redispatched.clone(),
            orphans_reconciled: self.orphans_reconciled.clone(),
            skipped: self.skipped.clone(),
            failed: self.failed.clone(),
            leftovers_removed: self.leftovers_removed,
            tasks: Vec::new(),
        }
    }

    /// Wait for every re-attached job to finish, moving failures into
    /// [`failed`](Self::failed).
    pub async fn wait(&mut self) {
        for (id, task) in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(id = %id, error = %e, "Recovery task failed");
                    self.failed.push(id);
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Recovery task panicked");
                    self.failed.push(id);
                }
            }
        }
    }
}

/// Reconciles backend jobs with persisted runs after a restart.
pub struct RecoveryCoordinator {
    orchestrator: Arc<RunOrchestrator>,
    queue: RunQueue,
}

impl RecoveryCoordinator {
    /// Create a coordinator.
    pub fn new(orchestrator: Arc<RunOrchestrator>, queue: RunQueue) -> Self {
        Self {
            orchestrator,
            queue,
        }
    }

    /// Run one recovery pass.
    ///
    /// Returns once every lock is taken and every re-attach is spawned; the
    /// re-attached jobs keep running in the background (see
    /// [`RecoveryReport::wait`]).
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let backend = self.orchestrator.commands().backend().clone();

        match backend.sweep_leftovers().await {
            Ok(0) => {}
            Ok(removed) => {
                info!(removed, "Removed leftover command containers");
                report.leftovers_removed = removed;
            }
            Err(e) => warn!(error = %e, "Failed to sweep leftover containers"),
        }

        let active_workspaces = match backend.active_workspaces().await {
            Ok(workspaces) => workspaces,
            Err(e) => {
                warn!(error = %e, "Failed to list active jobs, assuming none");
                HashSet::new()
            }
        };

        let runs = match self
            .orchestrator
            .persistence()
            .list_runs_by_status(&RunStatus::ACTIVE)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "Failed to load active runs, skipping run recovery");
                Vec::new()
            }
        };

        info!(
            backend = backend.backend_type(),
            active_jobs = active_workspaces.len(),
            active_runs = runs.len(),
            "Recovery started"
        );

        let mut claimed: HashSet<Uuid> = HashSet::new();
        for run in runs {
            claimed.insert(run.workspace_id);
            self.recover_run(run, &mut report).await;
        }

        let mut orphans: Vec<Uuid> = active_workspaces.difference(&claimed).copied().collect();
        orphans.sort();
        for workspace_id in orphans {
            self.recover_orphan(workspace_id, &mut report).await;
        }

        info!(
            resumed = report.resumed.len(),
            redispatched = report.redispatched.len(),
            orphans = report.orphans_reconciled.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Recovery pass complete"
        );
        report
    }

    async fn recover_run(&self, run: Run, report: &mut RecoveryReport) {
        let run_id = run.id;
        match run.status {
            RunStatus::Queued | RunStatus::Initializing | RunStatus::PrePlanning => {
                let persistence = self.orchestrator.persistence();
                let phases = async {
                    let plan = persistence.get_plan_for_run(run_id).await?;
                    let apply = persistence.get_apply_for_run(run_id).await?;
                    Ok::<_, terrarun_core::CoreError>((plan, apply))
                };
                let (plan, apply) = match phases.await {
                    Ok(phases) => phases,
                    Err(e) => {
                        error!(run_id = %run_id, error = %e, "Failed to load run phases");
                        report.failed.push(run_id);
                        return;
                    }
                };
                let Some(event) = RunEvent::for_waiting_run(
                    run_id,
                    plan.map(|p| p.status),
                    apply.map(|a| a.status),
                ) else {
                    return;
                };
                self.queue.add(event);
                report.redispatched.push(run_id);
            }
            RunStatus::Planning | RunStatus::PostPlanning | RunStatus::Applying => {
                let lock = match self
                    .orchestrator
                    .lock_workspace(run.workspace_id, LockTimeout::Immediate)
                    .await
                {
                    Ok(lock) => lock,
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "Workspace busy, not resuming run");
                        report.skipped.push(run_id);
                        return;
                    }
                };
                info!(
                    run_id = %run_id,
                    workspace_id = %run.workspace_id,
                    status = %run.status,
                    "Resuming run"
                );
                let orchestrator = self.orchestrator.clone();
                let task = tokio::spawn(async move { orchestrator.resume_run(run, lock).await });
                report.resumed.push(run_id);
                report.tasks.push((run_id, task));
            }
            _ => {}
        }
    }

    async fn recover_orphan(&self, workspace_id: Uuid, report: &mut RecoveryReport) {
        let lock = match self
            .orchestrator
            .lock_workspace(workspace_id, LockTimeout::Immediate)
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "Workspace busy, skipping orphaned job");
                report.skipped.push(workspace_id);
                return;
            }
        };
        info!(workspace_id = %workspace_id, "Reconciling orphaned job");
        let orchestrator = self.orchestrator.clone();
        let task =
            tokio::spawn(async move { orchestrator.reconcile_orphan(workspace_id, lock).await });
        report.orphans_reconciled.push(workspace_id);
        report.tasks.push((workspace_id, task));
    }
}
