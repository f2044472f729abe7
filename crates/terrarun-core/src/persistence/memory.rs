// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence.
//!
//! Used by the engine's tests and by the daemon when no database URL is
//! configured. Every committed [`ChangeSet`] is kept in a log so callers can
//! assert on the exact sequence of writes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChangeSet, Persistence};
use crate::error::CoreError;
use crate::models::{Apply, Directory, Plan, Run, RunStatus, Workspace};

#[derive(Default)]
struct Store {
    directories: HashMap<Uuid, Directory>,
    workspaces: HashMap<Uuid, Workspace>,
    runs: HashMap<Uuid, Run>,
    plans: HashMap<Uuid, Plan>,
    applies: HashMap<Uuid, Apply>,
    commits: Vec<ChangeSet>,
}

/// Persistence backed by in-process maps.
#[derive(Default)]
pub struct MemoryPersistence {
    store: RwLock<Store>,
    failing_commits: AtomicUsize,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a directory.
    pub async fn insert_directory(&self, directory: Directory) {
        self.store
            .write()
            .await
            .directories
            .insert(directory.id, directory);
    }

    /// Insert or replace a workspace.
    pub async fn insert_workspace(&self, workspace: Workspace) {
        self.store
            .write()
            .await
            .workspaces
            .insert(workspace.id, workspace);
    }

    /// Insert or replace a run.
    pub async fn insert_run(&self, run: Run) {
        self.store.write().await.runs.insert(run.id, run);
    }

    /// Insert or replace a plan.
    pub async fn insert_plan(&self, plan: Plan) {
        self.store.write().await.plans.insert(plan.id, plan);
    }

    /// Insert or replace an apply.
    pub async fn insert_apply(&self, apply: Apply) {
        self.store.write().await.applies.insert(apply.id, apply);
    }

    /// Make the next `count` commits fail with a database error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Every change set committed so far, in order.
    pub async fn commits(&self) -> Vec<ChangeSet> {
        self.store.read().await.commits.clone()
    }

    /// Run statuses written for one run, in commit order.
    pub async fn run_status_history(&self, run_id: Uuid) -> Vec<RunStatus> {
        self.store
            .read()
            .await
            .commits
            .iter()
            .filter_map(|c| c.run.filter(|(id, _)| *id == run_id).map(|(_, s)| s))
            .collect()
    }

    fn take_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, CoreError> {
        Ok(self.store.read().await.workspaces.get(&id).cloned())
    }

    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, CoreError> {
        Ok(self.store.read().await.directories.get(&id).cloned())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, CoreError> {
        Ok(self.store.read().await.runs.get(&id).cloned())
    }

    async fn get_plan_for_run(&self, run_id: Uuid) -> Result<Option<Plan>, CoreError> {
        Ok(self
            .store
            .read()
            .await
            .plans
            .values()
            .find(|p| p.run_id == run_id)
            .cloned())
    }

    async fn get_apply_for_run(&self, run_id: Uuid) -> Result<Option<Apply>, CoreError> {
        Ok(self
            .store
            .read()
            .await
            .applies
            .values()
            .find(|a| a.run_id == run_id)
            .cloned())
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>, CoreError> {
        let store = self.store.read().await;
        let mut runs: Vec<Run> = store
            .runs
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn create_plan(&self, run_id: Uuid) -> Result<Plan, CoreError> {
        let mut store = self.store.write().await;
        if !store.runs.contains_key(&run_id) {
            return Err(CoreError::not_found("run", run_id));
        }
        if let Some(existing) = store.plans.values().find(|p| p.run_id == run_id) {
            return Ok(existing.clone());
        }
        let plan = Plan::new(run_id);
        store.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn create_apply(&self, run_id: Uuid) -> Result<Apply, CoreError> {
        let mut store = self.store.write().await;
        if !store.runs.contains_key(&run_id) {
            return Err(CoreError::not_found("run", run_id));
        }
        if let Some(existing) = store.applies.values().find(|a| a.run_id == run_id) {
            return Ok(existing.clone());
        }
        let apply = Apply::new(run_id);
        store.applies.insert(apply.id, apply.clone());
        Ok(apply)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), CoreError> {
        if self.take_failure() {
            return Err(CoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut store = self.store.write().await;

        // Validate everything before mutating anything.
        if let Some(sync) = &changes.workspace
            && !store.workspaces.contains_key(&sync.workspace_id)
        {
            return Err(CoreError::not_found("workspace", sync.workspace_id));
        }
        if let Some(update) = &changes.plan
            && !store.plans.contains_key(&update.plan_id)
        {
            return Err(CoreError::not_found("plan", update.plan_id));
        }
        if let Some(update) = &changes.apply
            && !store.applies.contains_key(&update.apply_id)
        {
            return Err(CoreError::not_found("apply", update.apply_id));
        }
        if let Some((run_id, _)) = &changes.run
            && !store.runs.contains_key(run_id)
        {
            return Err(CoreError::not_found("run", *run_id));
        }

        if let Some(sync) = &changes.workspace
            && let Some(workspace) = store.workspaces.get_mut(&sync.workspace_id)
        {
            if let Some(state) = &sync.state {
                workspace.state_backup = workspace.state.replace(state.clone());
            }
            if sync.synced_at.is_some() {
                workspace.last_synced_at = sync.synced_at;
            }
            workspace.sync_errors = sync.sync_errors.clone();
        }
        if let Some(update) = &changes.plan
            && let Some(plan) = store.plans.get_mut(&update.plan_id)
        {
            plan.status = update.status;
            if update.output.is_some() {
                plan.output = update.output.clone();
            }
        }
        if let Some(update) = &changes.apply
            && let Some(apply) = store.applies.get_mut(&update.apply_id)
        {
            apply.status = update.status;
            if update.output.is_some() {
                apply.output = update.output.clone();
            }
        }
        if let Some((run_id, status)) = changes.run
            && let Some(run) = store.runs.get_mut(&run_id)
        {
            run.status = status;
        }

        store.commits.push(changes);
        Ok(())
    }
}
