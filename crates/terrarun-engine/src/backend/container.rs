// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container job backend.
//!
//! Runs Terraform in a container per command through the Docker Engine API.
//! Containers are labeled with the workspace id so a restarted process can
//! find and re-attach to the jobs it started before going down.
//!
//! # Job lifecycle
//!
//! 1. Look for an existing job container for the workspace (conflict check)
//! 2. Create and start the container
//! 3. Wait until it is running (or already exited)
//! 4. Follow its logs, re-opening the stream from the last seen timestamp
//!    after transient disconnects
//! 5. Once it exited, read the exit code and run the finalizer until it succeeds
//! 6. Remove the container, retrying until Docker confirms it is gone
//!
//! Resuming performs steps 3-6 against an existing container.
//!
//! Every API call is retried with capped exponential backoff. "Not found"
//! is terminal and never retried.

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, ContainerSummary, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    ListImagesOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::env::{EnvPolicy, to_key_value_list};
use super::traits::*;
use super::versions::{VersionCache, sort_descending};
use crate::retry::{RetryPolicy, retry_unless};

/// Label carrying the application name.
pub const LABEL_APP: &str = "app";
/// Label carrying the workspace id.
pub const LABEL_WORKSPACE_ID: &str = "workspaceId";
/// Label carrying the workspace name.
pub const LABEL_WORKSPACE_NAME: &str = "workspaceName";
/// Label carrying the first Terraform argument.
pub const LABEL_COMMAND: &str = "command";
/// Label distinguishing long jobs from one-shot commands.
pub const LABEL_KIND: &str = "kind";

const KIND_JOB: &str = "job";
const KIND_EXEC: &str = "exec";

/// Configuration for the container backend.
#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    /// Image repository, tagged with the Terraform version.
    pub image: String,
    /// Value of the `app` label.
    pub app_name: String,
    /// Host directory holding all workspace working directories.
    pub host_workspaces_dir: PathBuf,
    /// Where `host_workspaces_dir` is mounted inside the container.
    pub container_root: String,
    /// Environment policy.
    pub env: EnvPolicy,
    /// Backoff for API calls and finalizers.
    pub retry: RetryPolicy,
    /// Only tags matching this are reported as versions.
    pub version_filter: Option<Regex>,
    /// How long the version list is cached.
    pub version_refresh: Duration,
    /// How many times readiness is polled before giving up.
    pub ready_attempts: u32,
    /// Grace period for a non-forced cancel.
    pub stop_grace: Duration,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            image: "hashicorp/terraform".to_string(),
            app_name: "terrarun".to_string(),
            host_workspaces_dir: PathBuf::from(".data/workspaces"),
            container_root: "/workspaces".to_string(),
            env: EnvPolicy::default(),
            retry: RetryPolicy::default(),
            version_filter: None,
            version_refresh: Duration::from_secs(300),
            ready_attempts: 20,
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// Labels attached to a container.
pub fn container_labels(
    app_name: &str,
    workspace: &WorkspaceContext,
    command: &str,
    kind: &str,
) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_APP.to_string(), app_name.to_string()),
        (
            LABEL_WORKSPACE_ID.to_string(),
            workspace.workspace_id.to_string(),
        ),
        (LABEL_WORKSPACE_NAME.to_string(), workspace.name.clone()),
        (LABEL_COMMAND.to_string(), command.to_string()),
        (LABEL_KIND.to_string(), kind.to_string()),
    ])
}

/// Workspace id of a job container belonging to `app_name`.
pub fn job_workspace_id(app_name: &str, labels: &HashMap<String, String>) -> Option<Uuid> {
    if labels.get(LABEL_APP).map(String::as_str) != Some(app_name)
        || labels.get(LABEL_KIND).map(String::as_str) != Some(KIND_JOB)
    {
        return None;
    }
    labels.get(LABEL_WORKSPACE_ID)?.parse().ok()
}

/// Whether a container is a one-shot exec container belonging to `app_name`.
pub fn is_exec_container(app_name: &str, labels: &HashMap<String, String>) -> bool {
    labels.get(LABEL_APP).map(String::as_str) == Some(app_name)
        && labels.get(LABEL_KIND).map(String::as_str) == Some(KIND_EXEC)
}

/// Version part of `repo:tag` when the repository is `image`.
pub fn tag_for_image<'a>(image: &str, repo_tag: &'a str) -> Option<&'a str> {
    repo_tag
        .strip_prefix(image)?
        .strip_prefix(':')
        .filter(|tag| !tag.is_empty() && *tag != "latest")
}

/// Tracks which log lines were already delivered across stream reconnects.
///
/// Docker's `since` filter has one-second resolution, so a re-opened stream
/// replays lines from the last second. Lines older than the last delivered
/// timestamp are dropped, and as many lines at exactly that timestamp as were
/// already delivered are skipped.
#[derive(Debug, Default)]
pub struct LogCursor {
    last: Option<DateTime<Utc>>,
    delivered_at_last: usize,
    replay_to_skip: usize,
}

impl LogCursor {
    /// Value for the `since` query parameter.
    ///
    /// Falls back to `0` when the timestamp does not fit the API's 32-bit
    /// field; the full replay is then filtered by [`accept`](Self::accept).
    pub fn since(&self) -> i32 {
        self.last
            .and_then(|t| i32::try_from(t.timestamp()).ok())
            .unwrap_or(0)
    }

    /// Call before re-opening the stream.
    pub fn reconnect(&mut self) {
        self.replay_to_skip = self.delivered_at_last;
    }

    /// Parse a timestamped Docker log line; returns the text if it is new.
    pub fn accept(&mut self, raw: &str) -> Option<String> {
        let Some((stamp, text)) = raw.split_once(' ') else {
            return self.accept_at(None, raw);
        };
        match DateTime::parse_from_rfc3339(stamp) {
            Ok(ts) => self.accept_at(Some(ts.with_timezone(&Utc)), text),
            Err(_) => self.accept_at(None, raw),
        }
    }

    fn accept_at(&mut self, ts: Option<DateTime<Utc>>, text: &str) -> Option<String> {
        let Some(ts) = ts else {
            return Some(text.to_string());
        };
        match self.last {
            Some(last) if ts < last => None,
            Some(last) if ts == last => {
                if self.replay_to_skip > 0 {
                    self.replay_to_skip -= 1;
                    None
                } else {
                    self.delivered_at_last += 1;
                    Some(text.to_string())
                }
            }
            _ => {
                self.last = Some(ts);
                self.delivered_at_last = 1;
                self.replay_to_skip = 0;
                Some(text.to_string())
            }
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[derive(Debug, Clone)]
struct JobContainer {
    name: String,
    command: String,
}

#[derive(Debug, Clone, Copy)]
struct ContainerStatus {
    running: bool,
    exited: bool,
    exit_code: Option<i64>,
}

/// Runs Terraform in Docker containers.
pub struct ContainerBackend {
    docker: Docker,
    config: ContainerBackendConfig,
    versions: VersionCache,
}

impl ContainerBackend {
    /// Connect to the local Docker daemon.
    pub fn connect(config: ContainerBackendConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, config))
    }

    /// Use an existing Docker client. A relative `host_workspaces_dir` is
    /// resolved against the current directory.
    pub fn with_client(docker: Docker, mut config: ContainerBackendConfig) -> Self {
        config.host_workspaces_dir = ensure_absolute_path(config.host_workspaces_dir);
        let versions = VersionCache::new(config.version_refresh);
        Self {
            docker,
            config,
            versions,
        }
    }

    fn container_workdir(&self, workspace: &WorkspaceContext) -> String {
        format!(
            "{}/{}",
            self.config.container_root.trim_end_matches('/'),
            workspace.workspace_id
        )
    }

    fn container_name(&self, workspace: &WorkspaceContext, kind: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            self.config.app_name,
            kind,
            workspace.workspace_id,
            &suffix[..8]
        )
    }

    async fn list_labeled(&self) -> std::result::Result<Vec<ContainerSummary>, BollardError> {
        let docker = &self.docker;
        retry_unless(
            self.config.retry,
            "list_containers",
            move || {
                let options = ListContainersOptionsBuilder::new().all(true).build();
                docker.list_containers(Some(options))
            },
            is_not_found,
        )
        .await
    }

    /// Remove exec containers a previous process left behind.
    async fn sweep_exec_containers(&self) -> Result<usize> {
        let leftovers: Vec<String> = self
            .list_labeled()
            .await?
            .into_iter()
            .filter(|summary| {
                summary
                    .labels
                    .as_ref()
                    .is_some_and(|labels| is_exec_container(&self.config.app_name, labels))
            })
            .filter_map(|summary| {
                summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .or(summary.id)
            })
            .collect();

        for name in &leftovers {
            info!(container = %name, "Removing leftover exec container");
            self.remove(name).await;
        }
        Ok(leftovers.len())
    }

    async fn find_job(&self, workspace_id: Uuid) -> Result<Option<JobContainer>> {
        let containers = self.list_labeled().await?;
        Ok(containers.into_iter().find_map(|summary| {
            let labels = summary.labels.unwrap_or_default();
            if job_workspace_id(&self.config.app_name, &labels) != Some(workspace_id) {
                return None;
            }
            let name = summary
                .names
                .and_then(|names| names.into_iter().next())
                .map(|n| n.trim_start_matches('/').to_string())
                .or(summary.id)?;
            Some(JobContainer {
                name,
                command: labels.get(LABEL_COMMAND).cloned().unwrap_or_default(),
            })
        }))
    }

    async fn status(&self, name: &str) -> Result<Option<ContainerStatus>> {
        let docker = &self.docker;
        let result = retry_unless(
            self.config.retry,
            "inspect_container",
            move || docker.inspect_container(name, None::<InspectContainerOptions>),
            is_not_found,
        )
        .await;

        match result {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                Ok(Some(ContainerStatus {
                    running: state.running.unwrap_or(false),
                    exited: state.status == Some(ContainerStateStatusEnum::EXITED),
                    exit_code: state.exit_code,
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_start(
        &self,
        workspace: &WorkspaceContext,
        args: &[String],
        overrides: &[(String, String)],
        kind: &str,
    ) -> Result<String> {
        let name = self.container_name(workspace, kind);
        let env = self.config.env.build_from_process(overrides);
        let bind = format!(
            "{}:{}",
            self.config.host_workspaces_dir.display(),
            self.config.container_root
        );

        let body = ContainerCreateBody {
            image: Some(format!("{}:{}", self.config.image, workspace.version)),
            cmd: Some(args.to_vec()),
            working_dir: Some(self.container_workdir(workspace)),
            env: Some(to_key_value_list(&env)),
            labels: Some(container_labels(
                &self.config.app_name,
                workspace,
                command_of(args),
                kind,
            )),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let docker = &self.docker;
        let create_name = name.as_str();
        retry_unless(
            self.config.retry,
            "create_container",
            move || {
                let options = CreateContainerOptionsBuilder::new()
                    .name(create_name)
                    .build();
                docker.create_container(Some(options), body.clone())
            },
            is_not_found,
        )
        .await
        .map_err(|e| match e {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => BackendError::InvalidVersion(format!("{}: {}", workspace.version, message)),
            other => other.into(),
        })?;

        retry_unless(
            self.config.retry,
            "start_container",
            move || docker.start_container(create_name, None::<StartContainerOptions>),
            is_not_found,
        )
        .await?;

        info!(
            workspace_id = %workspace.workspace_id,
            container = %name,
            command = %command_of(args),
            "Container started"
        );
        Ok(name)
    }

    /// Poll until the container runs or already exited.
    async fn wait_until_ready(&self, name: &str) -> Result<()> {
        let mut backoff = self.config.retry.backoff();
        for _ in 0..self.config.ready_attempts {
            match self.status(name).await? {
                Some(status) if status.running || status.exited => return Ok(()),
                Some(_) => debug!(container = %name, "Container not running yet"),
                None => return Err(BackendError::NotReady(name.to_string())),
            }
            backoff.wait().await;
        }
        Err(BackendError::NotReady(name.to_string()))
    }

    /// Follow logs until the container stops, surviving stream interruptions.
    async fn follow_logs(&self, name: &str, lines: Option<&LineSender>) -> Vec<String> {
        let mut collected = Vec::new();
        let mut cursor = LogCursor::default();
        let mut backoff = self.config.retry.backoff();

        loop {
            let options = LogsOptionsBuilder::new()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .timestamps(true)
                .since(cursor.since())
                .build();
            let mut stream = std::pin::pin!(self.docker.logs(name, Some(options)));
            let mut interrupted = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        backoff.reset();
                        for raw in chunk.to_string().lines() {
                            if let Some(text) = cursor.accept(raw) {
                                if let Some(lines) = lines {
                                    let _ = lines.send(text.clone());
                                }
                                collected.push(text);
                            }
                        }
                    }
                    Err(e) if is_not_found(&e) => return collected,
                    Err(e) => {
                        warn!(container = %name, error = %e, "Log stream interrupted");
                        interrupted = true;
                        break;
                    }
                }
            }

            if !interrupted {
                match self.status(name).await {
                    Ok(Some(status)) if status.running => {}
                    Ok(_) => return collected,
                    Err(e) => warn!(container = %name, error = %e, "Failed to inspect container"),
                }
            }

            cursor.reconnect();
            backoff.wait().await;
        }
    }

    /// Wait for the container to stop and return its exit code.
    async fn wait_for_exit(&self, name: &str) -> Result<i32> {
        let mut backoff = self.config.retry.backoff();
        loop {
            match self.status(name).await? {
                Some(status) if !status.running => {
                    return Ok(status.exit_code.map(|c| c as i32).unwrap_or(-1));
                }
                Some(_) => backoff.wait().await,
                // Vanished without a code; classify as failed.
                None => return Ok(-1),
            }
        }
    }

    async fn remove(&self, name: &str) {
        let docker = &self.docker;
        let result = retry_unless(
            self.config.retry,
            "remove_container",
            move || {
                let options = RemoveContainerOptionsBuilder::new()
                    .force(true)
                    .v(true)
                    .build();
                docker.remove_container(name, Some(options))
            },
            is_not_found,
        )
        .await;
        match result {
            Ok(()) => debug!(container = %name, "Container removed"),
            Err(e) if is_not_found(&e) => debug!(container = %name, "Container already gone"),
            Err(e) => error!(container = %name, error = %e, "Failed to remove container"),
        }
    }

    /// Steps 3-6 of the job lifecycle.
    async fn attach(
        &self,
        workspace: &WorkspaceContext,
        name: &str,
        lines: &LineSender,
        finalizer: &Finalizer,
    ) -> Result<JobOutcome> {
        self.wait_until_ready(name).await?;
        let collected = self.follow_logs(name, Some(lines)).await;
        let exit_code = self.wait_for_exit(name).await?;
        let output = CommandOutput::from_lines(&collected, exit_code);

        info!(
            workspace_id = %workspace.workspace_id,
            container = %name,
            exit_code,
            "Container job exited"
        );

        run_finalizer(
            self.config.retry,
            workspace.workspace_id,
            finalizer,
            &output,
        )
        .await;
        self.remove(name).await;

        Ok(JobOutcome {
            output,
            finalized: true,
        })
    }

    async fn fetch_versions(&self) -> Result<Vec<String>> {
        let docker = &self.docker;
        let images = retry_unless(
            self.config.retry,
            "list_images",
            move || docker.list_images(Some(ListImagesOptionsBuilder::new().build())),
            is_not_found,
        )
        .await?;

        let mut versions: Vec<String> = images
            .iter()
            .flat_map(|image| image.repo_tags.iter())
            .filter_map(|repo_tag| tag_for_image(&self.config.image, repo_tag))
            .filter(|tag| {
                self.config
                    .version_filter
                    .as_ref()
                    .is_none_or(|re| re.is_match(tag))
            })
            .map(str::to_string)
            .collect();
        sort_descending(&mut versions);
        versions.dedup();
        Ok(versions)
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn backend_type(&self) -> &'static str {
        "container"
    }

    async fn execute(
        &self,
        workspace: &WorkspaceContext,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        let name = self
            .create_and_start(workspace, args, &options.env, KIND_EXEC)
            .await?;
        self.wait_until_ready(&name).await?;
        let collected = self.follow_logs(&name, None).await;
        let exit_code = self.wait_for_exit(&name).await?;
        self.remove(&name).await;
        Ok(CommandOutput::from_lines(&collected, exit_code))
    }

    async fn run_job(
        &self,
        workspace: &WorkspaceContext,
        args: Vec<String>,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        let command = command_of(&args);
        if let Some(existing) = self.find_job(workspace.workspace_id).await? {
            check_command_conflict(workspace.workspace_id, &existing.command, command)?;
            info!(
                workspace_id = %workspace.workspace_id,
                container = %existing.name,
                "Job already exists, attaching"
            );
            return self
                .attach(workspace, &existing.name, &lines, &finalizer)
                .await;
        }

        let name = self
            .create_and_start(workspace, &args, &[], KIND_JOB)
            .await?;
        self.attach(workspace, &name, &lines, &finalizer).await
    }

    async fn resume(
        &self,
        workspace: &WorkspaceContext,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        match self.find_job(workspace.workspace_id).await? {
            Some(existing) => {
                info!(
                    workspace_id = %workspace.workspace_id,
                    container = %existing.name,
                    command = %existing.command,
                    "Resuming container job"
                );
                self.attach(workspace, &existing.name, &lines, &finalizer)
                    .await
            }
            None => {
                debug!(workspace_id = %workspace.workspace_id, "No container job to resume");
                Ok(JobOutcome::nothing_to_resume())
            }
        }
    }

    async fn cancel_run(&self, workspace: &WorkspaceContext, force: bool) -> Result<()> {
        let Some(job) = self.find_job(workspace.workspace_id).await? else {
            debug!(workspace_id = %workspace.workspace_id, "No container job to cancel");
            return Ok(());
        };
        let grace = if force {
            0
        } else {
            self.config.stop_grace.as_secs() as i32
        };

        let docker = &self.docker;
        let name = job.name.as_str();
        let result = retry_unless(
            self.config.retry,
            "stop_container",
            move || {
                let options = StopContainerOptionsBuilder::new().t(grace).build();
                docker.stop_container(name, Some(options))
            },
            is_not_found,
        )
        .await;

        match result {
            Ok(()) => {
                info!(
                    workspace_id = %workspace.workspace_id,
                    container = %job.name,
                    grace_secs = grace,
                    "Container stop requested"
                );
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_leftovers(&self) -> Result<usize> {
        self.sweep_exec_containers().await
    }

    async fn active_workspaces(&self) -> Result<HashSet<Uuid>> {
        let containers = self.list_labeled().await?;
        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                job_workspace_id(&self.config.app_name, &summary.labels.unwrap_or_default())
            })
            .collect())
    }

    async fn versions(&self) -> Result<Vec<String>> {
        self.versions
            .get_or_refresh(|| self.fetch_versions())
            .await
    }
}
