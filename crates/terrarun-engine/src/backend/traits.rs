// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backend trait definitions.
//!
//! A backend knows how to run the Terraform binary for a workspace: as a
//! local child process or as a container. Everything Terraform-specific
//! (argument grammar, init/select sequencing) lives in
//! [`TerraformCommands`](super::TerraformCommands), which composes over this
//! trait.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use terrarun_core::models::{Workspace, WorkspaceSettings};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::retry::{RetryPolicy, retry_forever};

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// A job with a different command already exists for the workspace.
    #[error("Workspace {workspace_id} is already running '{running}', refusing to start '{requested}'")]
    CommandConflict {
        /// Workspace the jobs belong to.
        workspace_id: Uuid,
        /// First argument of the existing job.
        running: String,
        /// First argument that was requested.
        requested: String,
    },

    /// A local process for the same command is already running.
    #[error("Workspace {0} already has a running process")]
    AlreadyRunning(Uuid),

    /// Neither the workspace nor its directories name a Terraform version.
    #[error("No Terraform version configured for workspace {0}")]
    NoVersion(Uuid),

    /// The requested Terraform version is not installed.
    #[error("Terraform version not available: {0}")]
    InvalidVersion(String),

    /// The process or container could not be started.
    #[error("Failed to start: {0}")]
    StartFailed(String),

    /// The container never became ready.
    #[error("Container {0} did not become ready")]
    NotReady(String),

    /// Docker Engine API error.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Resolve a relative path against the current working directory.
///
/// Child processes run in the workspace directory and Docker reads a
/// relative bind source as a volume name, so paths handed to either must
/// be absolute.
pub fn ensure_absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Everything a backend needs to know about the workspace it runs in.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceContext {
    /// Workspace ID, used as the job key and container label.
    pub workspace_id: Uuid,
    /// Terraform workspace name.
    pub name: String,
    /// Whether this is Terraform's `default` workspace.
    pub is_default: bool,
    /// Resolved Terraform version.
    pub version: String,
    /// Resolved `-parallelism`.
    pub parallelism: Option<i32>,
    /// Host path of the working directory.
    pub working_dir: PathBuf,
    /// State file location when it lives outside the working directory.
    pub state_path: Option<String>,
}

impl WorkspaceContext {
    /// Build a context from a workspace and its resolved settings.
    ///
    /// The working directory is `<workspaces_root>/<workspace id>`.
    pub fn resolve(
        workspace: &Workspace,
        settings: &WorkspaceSettings,
        default_version: Option<&str>,
        workspaces_root: &std::path::Path,
    ) -> Result<Self> {
        let version = settings
            .terraform_version
            .as_deref()
            .or(default_version)
            .ok_or(BackendError::NoVersion(workspace.id))?;

        Ok(Self {
            workspace_id: workspace.id,
            name: workspace.name.clone(),
            is_default: workspace.is_default,
            version: version.to_string(),
            parallelism: settings.parallelism,
            working_dir: workspaces_root.join(workspace.id.to_string()),
            state_path: workspace.state_path.clone(),
        })
    }
}

/// Result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Output lines joined with `\n`.
    pub output: String,
    /// Process exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Build an output from collected lines.
    pub fn from_lines(lines: &[String], exit_code: i32) -> Self {
        Self {
            output: lines.join("\n"),
            exit_code,
        }
    }

    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of a long-running job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    /// Collected output and exit code.
    pub output: CommandOutput,
    /// Whether the finalizer ran. `false` when a resume found no job.
    pub finalized: bool,
}

impl JobOutcome {
    /// Outcome of resuming a workspace that had no job.
    pub fn nothing_to_resume() -> Self {
        Self::default()
    }
}

/// Extra options for one-shot commands.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Environment variables applied after the backend's own environment.
    pub env: Vec<(String, String)>,
}

impl ExecOptions {
    /// Add an environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Channel the backend pushes output lines onto.
pub type LineSender = mpsc::UnboundedSender<String>;

/// Callback invoked once a job has exited. Retried until it returns `Ok`.
pub type Finalizer =
    Arc<dyn Fn(CommandOutput) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Executes the Terraform binary for a workspace.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Name of this backend for logging.
    fn backend_type(&self) -> &'static str;

    /// Run a command to completion and return its output.
    async fn execute(
        &self,
        workspace: &WorkspaceContext,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput>;

    /// Start a long-running job, stream its lines and finalize it.
    ///
    /// Fails with [`BackendError::CommandConflict`] if a job with a
    /// different first argument already exists for the workspace.
    async fn run_job(
        &self,
        workspace: &WorkspaceContext,
        args: Vec<String>,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome>;

    /// Re-attach to an existing job without creating one.
    ///
    /// Returns [`JobOutcome::nothing_to_resume`] when no job exists.
    async fn resume(
        &self,
        workspace: &WorkspaceContext,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome>;

    /// Best-effort termination of the workspace's job.
    async fn cancel_run(&self, workspace: &WorkspaceContext, force: bool) -> Result<()>;

    /// Remove one-shot command leftovers from a previous process. Returns
    /// how many were removed.
    async fn sweep_leftovers(&self) -> Result<usize> {
        Ok(0)
    }

    /// Workspaces that currently have a live job.
    async fn active_workspaces(&self) -> Result<HashSet<Uuid>>;

    /// Installed Terraform versions, newest first.
    async fn versions(&self) -> Result<Vec<String>>;

    /// Whether `version` can be used.
    async fn is_valid_version(&self, version: &str) -> Result<bool> {
        Ok(self.versions().await?.iter().any(|v| v == version))
    }
}

/// Fail with [`BackendError::CommandConflict`] when `running` and `requested`
/// start with different commands.
pub fn check_command_conflict(workspace_id: Uuid, running: &str, requested: &str) -> Result<()> {
    if running != requested {
        return Err(BackendError::CommandConflict {
            workspace_id,
            running: running.to_string(),
            requested: requested.to_string(),
        });
    }
    Ok(())
}

/// First argument of a command line, or `""`.
pub fn command_of(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or_default()
}

/// Invoke a finalizer until it succeeds.
pub async fn run_finalizer(
    policy: RetryPolicy,
    workspace_id: Uuid,
    finalizer: &Finalizer,
    output: &CommandOutput,
) {
    retry_forever(policy, "finalizer", || finalizer(output.clone())).await;
    info!(
        workspace_id = %workspace_id,
        exit_code = output.exit_code,
        "Job finalized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrarun_core::models::Workspace;

    #[test]
    fn test_conflict_only_for_different_commands() {
        let id = Uuid::new_v4();
        assert!(check_command_conflict(id, "plan", "plan").is_ok());
        let err = check_command_conflict(id, "apply", "plan").unwrap_err();
        assert!(matches!(
            err,
            BackendError::CommandConflict { ref running, ref requested, .. }
                if running == "apply" && requested == "plan"
        ));
    }

    #[test]
    fn test_output_joins_lines() {
        let output = CommandOutput::from_lines(&["a".into(), "b".into()], 1);
        assert_eq!(output.output, "a\nb");
        assert!(!output.success());
    }

    #[test]
    fn test_context_resolution() {
        let workspace = Workspace::new(Uuid::new_v4(), "staging");
        let settings = WorkspaceSettings {
            terraform_version: None,
            parallelism: Some(3),
            azure_destroy_failure_threshold: None,
        };
        let root = std::path::Path::new("/srv/terrarun/workspaces");

        let err = WorkspaceContext::resolve(&workspace, &settings, None, root).unwrap_err();
        assert!(matches!(err, BackendError::NoVersion(_)));

        let ctx = WorkspaceContext::resolve(&workspace, &settings, Some("1.5.7"), root).unwrap();
        assert_eq!(ctx.version, "1.5.7");
        assert_eq!(ctx.parallelism, Some(3));
        assert_eq!(ctx.working_dir, root.join(workspace.id.to_string()));
        assert!(!ctx.is_default);
        assert!(ctx.state_path.is_none());
    }

    #[test]
    fn test_context_carries_state_path() {
        let mut workspace = Workspace::new(Uuid::new_v4(), "default");
        workspace.state_path = Some("../shared/prod.tfstate".into());
        let root = std::path::Path::new("/srv/terrarun/workspaces");

        let ctx =
            WorkspaceContext::resolve(&workspace, &WorkspaceSettings::default(), Some("1.5.7"), root)
                .unwrap();
        assert_eq!(ctx.state_path.as_deref(), Some("../shared/prod.tfstate"));
    }

    #[test]
    fn test_ensure_absolute_path() {
        let absolute = PathBuf::from("/srv/terrarun");
        assert_eq!(ensure_absolute_path(absolute.clone()), absolute);
        let resolved = ensure_absolute_path(PathBuf::from(".data/bin"));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with(".data/bin"));
    }
}
