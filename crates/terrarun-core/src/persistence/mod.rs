// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for terrarun-core.
//!
//! The run engine never touches storage directly. It loads entities by id,
//! queries runs by status and writes every post-execution mutation as one
//! [`ChangeSet`] so state, phase status and run status land together.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{
    Apply, ApplyStatus, Directory, Plan, PlanStatus, Run, RunStatus, Workspace, WorkspaceSettings,
};

/// Workspace fields written after state was pulled back from a working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceSync {
    /// Workspace to update.
    pub workspace_id: Uuid,
    /// New state. When set, the previous state moves to `state_backup`.
    pub state: Option<String>,
    /// New `last_synced_at`; left untouched when `None`.
    pub synced_at: Option<DateTime<Utc>>,
    /// New `sync_errors`; always written, `None` clears it.
    pub sync_errors: Option<String>,
}

impl WorkspaceSync {
    /// A successful sync, optionally carrying new state.
    pub fn synced(workspace_id: Uuid, state: Option<String>) -> Self {
        Self {
            workspace_id,
            state,
            synced_at: Some(Utc::now()),
            sync_errors: None,
        }
    }

    /// A failed sync. State and `last_synced_at` are left alone.
    pub fn failed(workspace_id: Uuid, errors: impl Into<String>) -> Self {
        Self {
            workspace_id,
            state: None,
            synced_at: None,
            sync_errors: Some(errors.into()),
        }
    }
}

/// New status (and optionally output) for a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanUpdate {
    /// Plan to update.
    pub plan_id: Uuid,
    /// New status.
    pub status: PlanStatus,
    /// New output; left untouched when `None`.
    pub output: Option<String>,
}

/// New status (and optionally output) for an apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyUpdate {
    /// Apply to update.
    pub apply_id: Uuid,
    /// New status.
    pub status: ApplyStatus,
    /// New output; left untouched when `None`.
    pub output: Option<String>,
}

/// A batch of mutations applied atomically by [`Persistence::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Workspace state/sync fields.
    pub workspace: Option<WorkspaceSync>,
    /// Plan status/output.
    pub plan: Option<PlanUpdate>,
    /// Apply status/output.
    pub apply: Option<ApplyUpdate>,
    /// Run id and its new status.
    pub run: Option<(Uuid, RunStatus)>,
}

impl ChangeSet {
    /// Empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the plan status and output.
    pub fn plan(mut self, plan_id: Uuid, status: PlanStatus, output: Option<String>) -> Self {
        self.plan = Some(PlanUpdate {
            plan_id,
            status,
            output,
        });
        self
    }

    /// Set the apply status and output.
    pub fn apply(mut self, apply_id: Uuid, status: ApplyStatus, output: Option<String>) -> Self {
        self.apply = Some(ApplyUpdate {
            apply_id,
            status,
            output,
        });
        self
    }

    /// Set the run status.
    pub fn run(mut self, run_id: Uuid, status: RunStatus) -> Self {
        self.run = Some((run_id, status));
        self
    }

    /// Set the workspace sync fields.
    pub fn workspace(mut self, sync: WorkspaceSync) -> Self {
        self.workspace = Some(sync);
        self
    }

    /// Whether nothing would be written.
    pub fn is_empty(&self) -> bool {
        self.workspace.is_none() && self.plan.is_none() && self.apply.is_none() && self.run.is_none()
    }
}

/// Storage used by the run engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load a workspace.
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, CoreError>;

    /// Load a directory.
    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, CoreError>;

    /// Load a run.
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, CoreError>;

    /// Load the plan of a run, if one was created.
    async fn get_plan_for_run(&self, run_id: Uuid) -> Result<Option<Plan>, CoreError>;

    /// Load the apply of a run, if one was created.
    async fn get_apply_for_run(&self, run_id: Uuid) -> Result<Option<Apply>, CoreError>;

    /// Runs whose status is in `statuses`, oldest first.
    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>, CoreError>;

    /// Create the run's plan, or return the existing one.
    async fn create_plan(&self, run_id: Uuid) -> Result<Plan, CoreError>;

    /// Create the run's apply, or return the existing one.
    async fn create_apply(&self, run_id: Uuid) -> Result<Apply, CoreError>;

    /// Apply every part of `changes` or none of them.
    async fn commit(&self, changes: ChangeSet) -> Result<(), CoreError>;

    /// Resolve inheritable settings by walking the directory ancestry.
    async fn resolve_workspace_settings(
        &self,
        workspace_id: Uuid,
    ) -> Result<WorkspaceSettings, CoreError> {
        let workspace = self
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workspace", workspace_id))?;

        let mut settings = WorkspaceSettings::from_workspace(&workspace);
        let mut visited = HashSet::new();
        let mut next = Some(workspace.directory_id);

        while let Some(directory_id) = next {
            if !visited.insert(directory_id) {
                return Err(CoreError::DirectoryCycle(directory_id));
            }
            let Some(directory) = self.get_directory(directory_id).await? else {
                break;
            };
            settings.inherit(&directory);
            next = directory.parent_id;
        }

        Ok(settings)
    }
}
