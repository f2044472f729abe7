// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local process backend.
//!
//! Runs `<binary_dir>/<version>/terraform` as a child process in the
//! workspace's working directory. Running jobs are tracked in memory only,
//! so nothing survives a restart: [`resume`](ExecutionBackend::resume) and
//! [`active_workspaces`](ExecutionBackend::active_workspaces) always report
//! that no job exists.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::env::EnvPolicy;
use super::traits::*;
use super::versions::sort_descending;
use crate::retry::RetryPolicy;

/// Name of the binary inside each version directory.
pub const TERRAFORM_BINARY: &str = "terraform";

/// Configuration for the local process backend.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Directory holding one sub-directory per installed version.
    pub binary_dir: PathBuf,
    /// Environment policy.
    pub env: EnvPolicy,
    /// Backoff for finalizer retries.
    pub retry: RetryPolicy,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            binary_dir: PathBuf::from(".data/bin"),
            env: EnvPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct LocalJob {
    command: String,
    pid: Option<u32>,
}

/// Removes a job from the process table when dropped.
struct JobSlot<'a> {
    jobs: &'a DashMap<Uuid, LocalJob>,
    workspace_id: Uuid,
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        self.jobs.remove(&self.workspace_id);
    }
}

/// Runs Terraform as a local child process.
pub struct LocalBackend {
    config: LocalBackendConfig,
    jobs: DashMap<Uuid, LocalJob>,
}

impl LocalBackend {
    /// Create a backend. A relative `binary_dir` is resolved against the
    /// current directory.
    pub fn new(mut config: LocalBackendConfig) -> Self {
        config.binary_dir = ensure_absolute_path(config.binary_dir);
        Self {
            config,
            jobs: DashMap::new(),
        }
    }

    /// Path of the binary for a version.
    pub fn binary_path(&self, version: &str) -> PathBuf {
        self.config.binary_dir.join(version).join(TERRAFORM_BINARY)
    }

    /// Number of tracked running jobs.
    pub fn running_jobs(&self) -> usize {
        self.jobs.len()
    }

    async fn spawn(
        &self,
        workspace: &WorkspaceContext,
        args: &[String],
        overrides: &[(String, String)],
    ) -> Result<Child> {
        let binary = self.binary_path(&workspace.version);
        if !tokio::fs::try_exists(&binary).await.unwrap_or(false) {
            return Err(BackendError::InvalidVersion(workspace.version.clone()));
        }
        let working_dir = ensure_absolute_path(workspace.working_dir.clone());
        tokio::fs::create_dir_all(&working_dir).await?;

        let env = self.config.env.build_from_process(overrides);
        debug!(
            workspace_id = %workspace.workspace_id,
            binary = %binary.display(),
            args = ?args,
            "Spawning terraform"
        );

        Command::new(&binary)
            .args(args)
            .current_dir(&working_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::StartFailed(format!("{}: {}", binary.display(), e)))
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    // `None` means the process was terminated by a signal.
    status.code().unwrap_or(-1)
}

fn spawn_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Merge stdout and stderr line by line until both close.
async fn collect_lines(child: &mut Child, forward: Option<&LineSender>) -> Vec<String> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx.clone());
    }
    drop(tx);

    let mut collected = Vec::new();
    while let Some(line) = rx.recv().await {
        if let Some(forward) = forward {
            let _ = forward.send(line.clone());
        }
        collected.push(line);
    }
    collected
}

async fn list_installed(binary_dir: &Path) -> Result<Vec<String>> {
    let mut versions = Vec::new();
    let mut entries = match tokio::fs::read_dir(binary_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let has_binary = tokio::fs::try_exists(entry.path().join(TERRAFORM_BINARY))
            .await
            .unwrap_or(false);
        if has_binary && let Some(name) = entry.file_name().to_str() {
            versions.push(name.to_string());
        }
    }
    sort_descending(&mut versions);
    Ok(versions)
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn backend_type(&self) -> &'static str {
        "local"
    }

    async fn execute(
        &self,
        workspace: &WorkspaceContext,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        let mut child = self.spawn(workspace, args, &options.env).await?;
        let lines = collect_lines(&mut child, None).await;
        let status = child.wait().await?;
        Ok(CommandOutput::from_lines(&lines, exit_code(status)))
    }

    async fn run_job(
        &self,
        workspace: &WorkspaceContext,
        args: Vec<String>,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        let workspace_id = workspace.workspace_id;
        let command = command_of(&args).to_string();

        match self.jobs.entry(workspace_id) {
            Entry::Occupied(existing) => {
                check_command_conflict(workspace_id, &existing.get().command, &command)?;
                return Err(BackendError::AlreadyRunning(workspace_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(LocalJob {
                    command: command.clone(),
                    pid: None,
                });
            }
        }
        let slot = JobSlot {
            jobs: &self.jobs,
            workspace_id,
        };

        let mut child = self.spawn(workspace, &args, &[]).await?;
        if let Some(mut job) = self.jobs.get_mut(&workspace_id) {
            job.pid = child.id();
        }
        info!(
            workspace_id = %workspace_id,
            command = %command,
            pid = ?child.id(),
            "Local job started"
        );

        let collected = collect_lines(&mut child, Some(&lines)).await;
        let status = child.wait().await?;
        drop(slot);

        let output = CommandOutput::from_lines(&collected, exit_code(status));
        info!(
            workspace_id = %workspace_id,
            command = %command,
            exit_code = output.exit_code,
            "Local job exited"
        );

        run_finalizer(self.config.retry, workspace_id, &finalizer, &output).await;
        Ok(JobOutcome {
            output,
            finalized: true,
        })
    }

    async fn resume(
        &self,
        workspace: &WorkspaceContext,
        _lines: LineSender,
        _finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        debug!(
            workspace_id = %workspace.workspace_id,
            "Local backend keeps no job registry, nothing to resume"
        );
        Ok(JobOutcome::nothing_to_resume())
    }

    async fn cancel_run(&self, workspace: &WorkspaceContext, force: bool) -> Result<()> {
        let pid = self
            .jobs
            .get(&workspace.workspace_id)
            .and_then(|job| job.pid);
        let Some(pid) = pid else {
            debug!(workspace_id = %workspace.workspace_id, "No local process to cancel");
            return Ok(());
        };

        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        match signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => {
                info!(
                    workspace_id = %workspace.workspace_id,
                    pid,
                    signal = ?signal,
                    "Sent signal to terraform process"
                );
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid, "Process already exited");
                Ok(())
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to signal terraform process");
                Err(BackendError::Other(format!("kill {pid}: {e}")))
            }
        }
    }

    async fn active_workspaces(&self) -> Result<HashSet<Uuid>> {
        Ok(HashSet::new())
    }

    async fn versions(&self) -> Result<Vec<String>> {
        list_installed(&self.config.binary_dir).await
    }
}
