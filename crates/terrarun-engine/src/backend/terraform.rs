// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform operations composed over an [`ExecutionBackend`].

use std::sync::Arc;

use super::args::{self, PlanRequest};
use super::env::TF_WORKSPACE;
use super::traits::*;

/// Terraform operations for any backend.
#[derive(Clone)]
pub struct TerraformCommands {
    backend: Arc<dyn ExecutionBackend>,
}

impl TerraformCommands {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// `terraform init`. Non-default workspaces get `TF_WORKSPACE` for the
    /// duration of the command so the backend initializes the right state.
    pub async fn init(&self, workspace: &WorkspaceContext) -> Result<CommandOutput> {
        let mut options = ExecOptions::default();
        if !workspace.is_default {
            options = options.with_env(TF_WORKSPACE, &workspace.name);
        }
        self.backend.execute(workspace, &args::init(), &options).await
    }

    /// `terraform workspace select`, creating the workspace if needed.
    pub async fn select_workspace(&self, workspace: &WorkspaceContext) -> Result<CommandOutput> {
        self.exec(workspace, args::select_workspace(&workspace.name))
            .await
    }

    /// `init`, then `workspace select` unless this is the default workspace.
    ///
    /// Stops at the first non-zero exit; the returned output covers every
    /// command that ran.
    pub async fn initialize_workspace(
        &self,
        workspace: &WorkspaceContext,
    ) -> Result<CommandOutput> {
        let init = self.init(workspace).await?;
        if !init.success() || workspace.is_default {
            return Ok(init);
        }

        let select = self.select_workspace(workspace).await?;
        let output = [init.output, select.output]
            .into_iter()
            .filter(|o| !o.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(CommandOutput {
            output,
            exit_code: select.exit_code,
        })
    }

    /// Start (or with `resume`, re-attach to) a plan job.
    pub async fn plan(
        &self,
        workspace: &WorkspaceContext,
        request: &PlanRequest,
        resume: bool,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        if resume {
            return self.backend.resume(workspace, lines, finalizer).await;
        }
        let args = args::plan(request, workspace.parallelism);
        self.backend
            .run_job(workspace, args, lines, finalizer)
            .await
    }

    /// Start (or with `resume`, re-attach to) an apply job for the saved plan.
    pub async fn apply(
        &self,
        workspace: &WorkspaceContext,
        resume: bool,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        if resume {
            return self.backend.resume(workspace, lines, finalizer).await;
        }
        let args = args::apply(workspace.parallelism);
        self.backend
            .run_job(workspace, args, lines, finalizer)
            .await
    }

    /// Re-attach to whatever job exists for the workspace.
    pub async fn resume(
        &self,
        workspace: &WorkspaceContext,
        lines: LineSender,
        finalizer: Finalizer,
    ) -> Result<JobOutcome> {
        self.backend.resume(workspace, lines, finalizer).await
    }

    /// `terraform show -json` of the saved plan or the current state.
    pub async fn show(&self, workspace: &WorkspaceContext, plan: bool) -> Result<CommandOutput> {
        self.exec(
            workspace,
            args::show(plan, workspace.state_path.as_deref()),
        )
        .await
    }

    /// `terraform taint <address>`
    pub async fn taint(&self, workspace: &WorkspaceContext, address: &str) -> Result<CommandOutput> {
        self.exec(
            workspace,
            args::taint(address, workspace.state_path.as_deref()),
        )
        .await
    }

    /// `terraform untaint <address>`
    pub async fn untaint(
        &self,
        workspace: &WorkspaceContext,
        address: &str,
    ) -> Result<CommandOutput> {
        self.exec(
            workspace,
            args::untaint(address, workspace.state_path.as_deref()),
        )
        .await
    }

    /// `terraform state rm <address>...`
    pub async fn remove_resources(
        &self,
        workspace: &WorkspaceContext,
        addresses: &[String],
    ) -> Result<CommandOutput> {
        self.exec(
            workspace,
            args::remove_resources(addresses, workspace.state_path.as_deref()),
        )
        .await
    }

    /// `terraform import <address> <id>`
    pub async fn import(
        &self,
        workspace: &WorkspaceContext,
        address: &str,
        id: &str,
    ) -> Result<CommandOutput> {
        self.exec(
            workspace,
            args::import(address, id, workspace.state_path.as_deref()),
        )
        .await
    }

    /// `terraform refresh`
    pub async fn refresh(&self, workspace: &WorkspaceContext) -> Result<CommandOutput> {
        self.exec(
            workspace,
            args::refresh(workspace.parallelism, workspace.state_path.as_deref()),
        )
        .await
    }

    /// `terraform output -json`
    pub async fn get_outputs(&self, workspace: &WorkspaceContext) -> Result<CommandOutput> {
        self.exec(workspace, args::outputs(workspace.state_path.as_deref()))
            .await
    }

    /// Ask the backend to stop the workspace's job.
    pub async fn cancel_run(&self, workspace: &WorkspaceContext, force: bool) -> Result<()> {
        self.backend.cancel_run(workspace, force).await
    }

    async fn exec(&self, workspace: &WorkspaceContext, args: Vec<String>) -> Result<CommandOutput> {
        self.backend
            .execute(workspace, &args, &ExecOptions::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{InvocationKind, MockBackend, MockResponse};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn workspace(name: &str) -> WorkspaceContext {
        WorkspaceContext {
            workspace_id: Uuid::new_v4(),
            name: name.into(),
            is_default: name == "default",
            version: "1.5.7".into(),
            parallelism: Some(4),
            working_dir: PathBuf::from("/tmp/ws"),
            state_path: None,
        }
    }

    #[tokio::test]
    async fn test_default_workspace_only_runs_init() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("init", MockResponse::success(&["Terraform has been successfully initialized!"]));
        let commands = TerraformCommands::new(backend.clone());
        let ws = workspace("default");

        let output = commands.initialize_workspace(&ws).await.unwrap();
        assert!(output.success());

        let calls = backend.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, vec!["init", "-input=false"]);
        assert!(calls[0].env.is_empty());
    }

    #[tokio::test]
    async fn test_named_workspace_selects_after_init() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("init", MockResponse::success(&["initialized"]));
        backend.respond("workspace", MockResponse::success(&["Switched to workspace \"staging\"."]));
        let commands = TerraformCommands::new(backend.clone());
        let ws = workspace("staging");

        let output = commands.initialize_workspace(&ws).await.unwrap();
        assert_eq!(output.output, "initialized\nSwitched to workspace \"staging\".");

        let calls = backend.invocations();
        assert_eq!(
            calls[0].env,
            vec![(TF_WORKSPACE.to_string(), "staging".to_string())]
        );
        assert_eq!(
            calls[1].args,
            vec!["workspace", "select", "-or-create=true", "staging"]
        );
        assert!(calls[1].env.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_stops_at_failed_init() {
        let backend = Arc::new(MockBackend::new());
        backend.respond("init", MockResponse::failure(1, &["Error: Failed to query available provider packages"]));
        let commands = TerraformCommands::new(backend.clone());

        let output = commands
            .initialize_workspace(&workspace("staging"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert_eq!(backend.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_uses_workspace_parallelism() {
        let backend = Arc::new(MockBackend::new());
        let commands = TerraformCommands::new(backend.clone());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let finalizer: Finalizer = Arc::new(
            |_: CommandOutput| -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(async { Ok(()) })
            },
        );

        commands
            .plan(&workspace("default"), &PlanRequest::default(), false, tx, finalizer)
            .await
            .unwrap();

        let calls = backend.invocations();
        assert_eq!(calls[0].kind, InvocationKind::Job);
        assert_eq!(
            calls[0].args,
            vec!["plan", "-input=false", "-out=plan", "-parallelism=4"]
        );
    }

    #[tokio::test]
    async fn test_out_of_tree_state_path() {
        let backend = Arc::new(MockBackend::new());
        let commands = TerraformCommands::new(backend.clone());
        let mut ws = workspace("default");
        ws.state_path = Some("../shared/prod.tfstate".into());

        commands.taint(&ws, "aws_instance.web").await.unwrap();
        commands.show(&ws, false).await.unwrap();

        let calls = backend.invocations();
        assert_eq!(
            calls[0].args,
            vec!["taint", "-state=../shared/prod.tfstate", "aws_instance.web"]
        );
        assert_eq!(calls[1].args, vec!["show", "-json", "../shared/prod.tfstate"]);
    }
}
