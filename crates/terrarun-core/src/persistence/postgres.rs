// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{ChangeSet, Persistence};
use crate::error::CoreError;
use crate::models::{Apply, Directory, Plan, Run, RunStatus, Workspace};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a directory.
    pub async fn insert_directory(&self, directory: &Directory) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO directories (id, parent_id, name, terraform_version, parallelism,
                                     azure_destroy_failure_threshold)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(directory.id)
        .bind(directory.parent_id)
        .bind(&directory.name)
        .bind(&directory.terraform_version)
        .bind(directory.parallelism)
        .bind(directory.azure_destroy_failure_threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a workspace.
    pub async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, directory_id, name, is_default, terraform_version,
                                    parallelism, dynamic_host, azure_destroy_failure_threshold,
                                    last_synced_at, state, state_backup, sync_errors, state_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(workspace.id)
        .bind(workspace.directory_id)
        .bind(&workspace.name)
        .bind(workspace.is_default)
        .bind(&workspace.terraform_version)
        .bind(workspace.parallelism)
        .bind(workspace.dynamic_host)
        .bind(workspace.azure_destroy_failure_threshold)
        .bind(workspace.last_synced_at)
        .bind(&workspace.state)
        .bind(&workspace.state_backup)
        .bind(&workspace.sync_errors)
        .bind(&workspace.state_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a run.
    pub async fn insert_run(&self, run: &Run) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, workspace_id, created_at, is_destroy, targets,
                              replace_addresses, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(run.workspace_id)
        .bind(run.created_at)
        .bind(run.is_destroy)
        .bind(&run.targets)
        .bind(&run.replace_addresses)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workspace_id: Uuid,
    created_at: DateTime<Utc>,
    is_destroy: bool,
    targets: Vec<String>,
    replace_addresses: Vec<String>,
    status: String,
}

impl TryFrom<RunRow> for Run {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            workspace_id: row.workspace_id,
            created_at: row.created_at,
            is_destroy: row.is_destroy,
            targets: row.targets,
            replace_addresses: row.replace_addresses,
            status: row.status.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PhaseRow {
    id: Uuid,
    run_id: Uuid,
    status: String,
    output: Option<String>,
}

impl TryFrom<PhaseRow> for Plan {
    type Error = CoreError;

    fn try_from(row: PhaseRow) -> Result<Self, Self::Error> {
        Ok(Plan {
            id: row.id,
            run_id: row.run_id,
            status: row.status.parse()?,
            output: row.output,
        })
    }
}

impl TryFrom<PhaseRow> for Apply {
    type Error = CoreError;

    fn try_from(row: PhaseRow) -> Result<Self, Self::Error> {
        Ok(Apply {
            id: row.id,
            run_id: row.run_id,
            status: row.status.parse()?,
            output: row.output,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: Uuid,
    directory_id: Uuid,
    name: String,
    is_default: bool,
    terraform_version: Option<String>,
    parallelism: Option<i32>,
    dynamic_host: bool,
    azure_destroy_failure_threshold: Option<i32>,
    last_synced_at: Option<DateTime<Utc>>,
    state: Option<String>,
    state_backup: Option<String>,
    sync_errors: Option<String>,
    state_path: Option<String>,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace {
            id: row.id,
            directory_id: row.directory_id,
            name: row.name,
            is_default: row.is_default,
            terraform_version: row.terraform_version,
            parallelism: row.parallelism,
            dynamic_host: row.dynamic_host,
            azure_destroy_failure_threshold: row.azure_destroy_failure_threshold,
            last_synced_at: row.last_synced_at,
            state: row.state,
            state_backup: row.state_backup,
            sync_errors: row.sync_errors,
            state_path: row.state_path,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DirectoryRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    name: String,
    terraform_version: Option<String>,
    parallelism: Option<i32>,
    azure_destroy_failure_threshold: Option<i32>,
}

impl From<DirectoryRow> for Directory {
    fn from(row: DirectoryRow) -> Self {
        Directory {
            id: row.id,
            parent_id: row.parent_id,
            name: row.name,
            terraform_version: row.terraform_version,
            parallelism: row.parallelism,
            azure_destroy_failure_threshold: row.azure_destroy_failure_threshold,
        }
    }
}

const RUN_COLUMNS: &str =
    "id, workspace_id, created_at, is_destroy, targets, replace_addresses, status";

// ============================================================================
// Persistence Implementation
// ============================================================================

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, CoreError> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT id, directory_id, name, is_default, terraform_version, parallelism,
                   dynamic_host, azure_destroy_failure_threshold, last_synced_at,
                   state, state_backup, sync_errors, state_path
            FROM workspaces
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Workspace::from))
    }

    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, CoreError> {
        let row = sqlx::query_as::<_, DirectoryRow>(
            r#"
            SELECT id, parent_id, name, terraform_version, parallelism,
                   azure_destroy_failure_threshold
            FROM directories
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Directory::from))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, CoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn get_plan_for_run(&self, run_id: Uuid) -> Result<Option<Plan>, CoreError> {
        let row = sqlx::query_as::<_, PhaseRow>(
            "SELECT id, run_id, status, output FROM plans WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn get_apply_for_run(&self, run_id: Uuid) -> Result<Option<Apply>, CoreError> {
        let row = sqlx::query_as::<_, PhaseRow>(
            "SELECT id, run_id, status, output FROM applies WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Apply::try_from).transpose()
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>, CoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn create_plan(&self, run_id: Uuid) -> Result<Plan, CoreError> {
        let candidate = Plan::new(run_id);
        let row = sqlx::query_as::<_, PhaseRow>(
            r#"
            WITH inserted AS (
                INSERT INTO plans (id, run_id, status)
                VALUES ($1, $2, $3)
                ON CONFLICT (run_id) DO NOTHING
                RETURNING id, run_id, status, output
            )
            SELECT id, run_id, status, output FROM inserted
            UNION ALL
            SELECT id, run_id, status, output FROM plans WHERE run_id = $2
            LIMIT 1
            "#,
        )
        .bind(candidate.id)
        .bind(run_id)
        .bind(candidate.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| foreign_key_to_not_found(e, "run", run_id))?;

        row.ok_or_else(|| CoreError::not_found("run", run_id))?
            .try_into()
    }

    async fn create_apply(&self, run_id: Uuid) -> Result<Apply, CoreError> {
        let candidate = Apply::new(run_id);
        let row = sqlx::query_as::<_, PhaseRow>(
            r#"
            WITH inserted AS (
                INSERT INTO applies (id, run_id, status)
                VALUES ($1, $2, $3)
                ON CONFLICT (run_id) DO NOTHING
                RETURNING id, run_id, status, output
            )
            SELECT id, run_id, status, output FROM inserted
            UNION ALL
            SELECT id, run_id, status, output FROM applies WHERE run_id = $2
            LIMIT 1
            "#,
        )
        .bind(candidate.id)
        .bind(run_id)
        .bind(candidate.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| foreign_key_to_not_found(e, "run", run_id))?;

        row.ok_or_else(|| CoreError::not_found("run", run_id))?
            .try_into()
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(sync) = &changes.workspace {
            // SET expressions see the pre-update row, so the backup takes the old state.
            let result = sqlx::query(
                r#"
                UPDATE workspaces
                SET state_backup = CASE WHEN $2::text IS NULL THEN state_backup ELSE state END,
                    state = COALESCE($2, state),
                    last_synced_at = COALESCE($3, last_synced_at),
                    sync_errors = $4
                WHERE id = $1
                "#,
            )
            .bind(sync.workspace_id)
            .bind(&sync.state)
            .bind(sync.synced_at)
            .bind(&sync.sync_errors)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("workspace", sync.workspace_id));
            }
        }

        if let Some(update) = &changes.plan {
            let result = sqlx::query(
                "UPDATE plans SET status = $2, output = COALESCE($3, output) WHERE id = $1",
            )
            .bind(update.plan_id)
            .bind(update.status.as_str())
            .bind(&update.output)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("plan", update.plan_id));
            }
        }

        if let Some(update) = &changes.apply {
            let result = sqlx::query(
                "UPDATE applies SET status = $2, output = COALESCE($3, output) WHERE id = $1",
            )
            .bind(update.apply_id)
            .bind(update.status.as_str())
            .bind(&update.output)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("apply", update.apply_id));
            }
        }

        if let Some((run_id, status)) = changes.run {
            let result = sqlx::query("UPDATE runs SET status = $2 WHERE id = $1")
                .bind(run_id)
                .bind(status.as_str())
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("run", run_id));
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

fn foreign_key_to_not_found(error: sqlx::Error, entity: &'static str, id: Uuid) -> CoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            CoreError::not_found(entity, id)
        }
        _ => CoreError::Database(error),
    }
}
