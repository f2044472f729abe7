// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scriptable in-memory backend.
//!
//! Responses are keyed by the first Terraform argument (`init`, `plan`,
//! `apply`, ...). A job can be seeded as already running to simulate a
//! container that outlived the process, which is what recovery re-attaches to.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::traits::*;
use crate::retry::RetryPolicy;

/// Scripted result of a command.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    /// Exit code reported.
    pub exit_code: i32,
    /// Lines emitted, in order.
    pub lines: Vec<String>,
    /// Simulated run time.
    pub delay: Duration,
}

impl MockResponse {
    /// Exit code 0 with the given lines.
    pub fn success(lines: &[&str]) -> Self {
        Self::failure(0, lines)
    }

    /// Given exit code and lines.
    pub fn failure(exit_code: i32, lines: &[&str]) -> Self {
        Self {
            exit_code,
            lines: lines.iter().map(|l| l.to_string()).collect(),
            delay: Duration::ZERO,
        }
    }

    /// Set the simulated run time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// How the backend was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// One-shot [`execute`](ExecutionBackend::execute).
    Execute,
    /// Newly created job.
    Job,
    /// Re-attached job.
    Resume,
}

/// A recorded backend call.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Call kind.
    pub kind: InvocationKind,
    /// Workspace the call was for.
    pub workspace_id: Uuid,
    /// Full argument list; for resumes, the seeded command only.
    pub args: Vec<String>,
    /// Per-command environment overrides.
    pub env: Vec<(String, String)>,
    /// When the command started.
    pub started: Instant,
    /// When it finished, if it did.
    pub finished: Option<Instant>,
}

impl Invocation {
    /// First argument.
    pub fn command(&self) -> &str {
        command_of(&self.args)
    }
}

#[derive(Debug, Clone)]
struct ActiveJob {
    command: String,
    response: MockResponse,
}

#[derive(Debug, Default)]
struct MockState {
    once: HashMap<String, VecDeque<MockResponse>>,
    responses: HashMap<String, MockResponse>,
    active: HashMap<Uuid, ActiveJob>,
    invocations: Vec<Invocation>,
    cancelled: Vec<(Uuid, bool)>,
    versions: Vec<String>,
    leftovers: usize,
    sweeps: usize,
}

impl MockState {
    fn response_for(&mut self, command: &str) -> MockResponse {
        if let Some(next) = self.once.get_mut(command).and_then(VecDeque::pop_front) {
            return next;
        }
        self.responses.get(command).cloned().unwrap_or_default()
    }

    fn record(
        &mut self,
        kind: InvocationKind,
        workspace_id: Uuid,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> usize {
        self.invocations.push(Invocation {
            kind,
            workspace_id,
            args,
            env,
            started: Instant::now(),
            finished: None,
        });
        self.invocations.len() - 1
    }
}

/// In-memory [`ExecutionBackend`] for tests and dry runs.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
    retry: RetryPolicy,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend where every command succeeds silently.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    /// Use a different finalizer backoff.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pretend `count` one-shot commands were left behind by a crash.
    pub fn seed_leftovers(&self, count: usize) {
        self.state.lock().leftovers = count;
    }

    /// How many times leftovers were swept.
    pub fn sweeps(&self) -> usize {
        self.state.lock().sweeps
    }

    /// Default response for a command.
    pub fn respond(&self, command: &str, response: MockResponse) {
        self.state
            .lock()
            .responses
            .insert(command.to_string(), response);
    }

    /// Response used for the next invocation of a command only.
    pub fn respond_once(&self, command: &str, response: MockResponse) {
        self.state
            .lock()
            .once
            .entry(command.to_string())
            .or_default()
            .push_back(response);
    }

    /// Pretend a job is already running for the workspace.
    pub fn seed_active_job(&self, workspace_id: Uuid, command: &str, response: MockResponse) {
        self.state.lock().active.insert(
            workspace_id,
            ActiveJob {
                command: command.to_string(),
                response,
            },
        );
    }

    /// Installed versions. When empty every version is accepted.
    pub fn set_versions(&self, versions: &[&str]) {
        self.state.lock().versions = versions.iter().map(|v| v.to_string()).collect();
    }

    /// All recorded calls.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    /// Recorded calls for one workspace.
    pub fn invocations_for(&self, workspace_id: Uuid) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.workspace_id == workspace_id)
            .collect()
    }

    /// Number of newly created jobs.
    pub fn created_jobs(&self) -> usize {
        self.count(InvocationKind::Job)
    }

    /// Number of re-attached jobs.
    pub fn resumed_jobs(&self) -> usize {
        self.count(InvocationKind::Resume)
    }

    fn count(&self, kind: InvocationKind) -> usize {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|i| i.kind == kind)
            .count()
    }

    /// `(start, end)` of every finished job and resume, in start order.
    pub fn job_windows(&self, workspace_id: Uuid) -> Vec<(Instant, Instant)> {
        let mut windows: Vec<_> = self
            .invocations_for(workspace_id)
            .into_iter()
            .filter(|i| i.kind != InvocationKind::Execute)
            .filter_map(|i| Some((i.started, i.finished?)))
            .collect();
        windows.sort();
        windows
    }

    /// `(workspace, force)` for every cancel request.
    pub fn cancelled(&self) -> Vec<(Uuid, bool)> {
        self.state.lock().cancelled.clone()
    }

    fn finish(&self, index: usize) {
        if let Some(invocation) = self.state.lock().invocations.get_mut(index) {
            invocation.finished = Some(Instant::now());
        }
    }

    async fn play(
        &self,
        index: usize,
        workspace_id: Uuid,
        response: MockResponse,
        lines: &LineSender,
        finalizer: &Finalizer,
    ) -> JobOutcome {
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        for line in &response.lines {
            let _ = lines.send(line.clone());
        }
        self.state.lock().active.remove(&workspace_id);
        self.finish(index);

        let output = CommandOutput::from_lines(&response.lines, response.exit_code);
        run_finalizer(self.retry, workspace_id, finalizer, &output).await;
        JobOutcome {
            output,
            finalized: true,
        }
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(
        &self,
        workspace: &WorkspaceContext,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        let (index, response) = {
            let mut state = self.state.lock();
            let response = state.response_for(command_of(args));
            let index = state.record(
                InvocationKind::Execute,
                workspace.workspace_id,
                args.to_vec(),
                options.env.clone(),
            );
            (index, response)
        };
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        self.finish(index);
        Ok(CommandOutput::from_lines(&response.lines, response.exit_code))
    }

    async fn run_job(
        &self,
        workspace: &WorkspaceContext,
        args: Vec<String>,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        let workspace_id = workspace.workspace_id;
        let (index, response) = {
            let mut state = self.state.lock();
            let command = command_of(&args).to_string();
            let existing = state.active.get(&workspace_id).cloned();
            let (kind, response) = match existing {
                Some(existing) => {
                    check_command_conflict(workspace_id, &existing.command, &command)?;
                    (InvocationKind::Resume, existing.response.clone())
                }
                None => {
                    let response = state.response_for(&command);
                    state.active.insert(
                        workspace_id,
                        ActiveJob {
                            command,
                            response: response.clone(),
                        },
                    );
                    (InvocationKind::Job, response)
                }
            };
            (state.record(kind, workspace_id, args, Vec::new()), response)
        };

        Ok(self
            .play(index, workspace_id, response, &lines, &finalizer)
            .await)
    }

    async fn resume(
        &self,
        workspace: &WorkspaceContext,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        let workspace_id = workspace.workspace_id;
        let (index, response) = {
            let mut state = self.state.lock();
            let Some(job) = state.active.get(&workspace_id).cloned() else {
                return Ok(JobOutcome::nothing_to_resume());
            };
            let index = state.record(
                InvocationKind::Resume,
                workspace_id,
                vec![job.command],
                Vec::new(),
            );
            (index, job.response)
        };

        Ok(self
            .play(index, workspace_id, response, &lines, &finalizer)
            .await)
    }

    async fn cancel_run(&self, workspace: &WorkspaceContext, force: bool) -> Result<()> {
        self.state
            .lock()
            .cancelled
            .push((workspace.workspace_id, force));
        Ok(())
    }

    async fn sweep_leftovers(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.sweeps += 1;
        Ok(std::mem::take(&mut state.leftovers))
    }

    async fn active_workspaces(&self) -> Result<HashSet<Uuid>> {
        Ok(self.state.lock().active.keys().copied().collect())
    }

    async fn versions(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().versions.clone())
    }

    async fn is_valid_version(&self, version: &str) -> Result<bool> {
        let versions = self.versions().await?;
        Ok(versions.is_empty() || versions.iter().any(|v| v == version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn workspace() -> WorkspaceContext {
        WorkspaceContext {
            workspace_id: Uuid::new_v4(),
            name: "default".into(),
            is_default: true,
            version: "1.5.7".into(),
            parallelism: None,
            working_dir: PathBuf::from("/tmp/ws"),
            state_path: None,
        }
    }

    fn counting_finalizer(calls: Arc<AtomicUsize>) -> Finalizer {
        Arc::new(move |_output: CommandOutput| -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_job_streams_lines_and_finalizes() {
        let backend = MockBackend::new();
        backend.respond("plan", MockResponse::success(&["Plan: 1 to add"]));
        let ws = workspace();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = backend
            .run_job(&ws, vec!["plan".into()], tx, counting_finalizer(calls.clone()))
            .await
            .unwrap();

        assert!(outcome.finalized);
        assert_eq!(outcome.output.output, "Plan: 1 to add");
        assert_eq!(rx.recv().await.as_deref(), Some("Plan: 1 to add"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.active_workspaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seeded_job_conflicts_with_other_command() {
        let backend = MockBackend::new();
        let ws = workspace();
        backend.seed_active_job(ws.workspace_id, "apply", MockResponse::success(&[]));
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = backend
            .run_job(
                &ws,
                vec!["plan".into()],
                tx,
                counting_finalizer(Arc::new(AtomicUsize::new(0))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::CommandConflict { .. }));
        assert_eq!(backend.created_jobs(), 0);
    }

    #[tokio::test]
    async fn test_resume_without_job() {
        let backend = MockBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = backend
            .resume(&workspace(), tx, counting_finalizer(calls.clone()))
            .await
            .unwrap();
        assert!(!outcome.finalized);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.resumed_jobs(), 0);
    }

    #[tokio::test]
    async fn test_respond_once_then_default() {
        let backend = MockBackend::new();
        backend.respond("init", MockResponse::success(&["ok"]));
        backend.respond_once("init", MockResponse::failure(1, &["boom"]));
        let ws = workspace();

        let first = backend
            .execute(&ws, &["init".into()], &ExecOptions::default())
            .await
            .unwrap();
        let second = backend
            .execute(&ws, &["init".into()], &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!((first.exit_code, first.output.as_str()), (1, "boom"));
        assert_eq!((second.exit_code, second.output.as_str()), (0, "ok"));
    }
}
