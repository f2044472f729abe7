// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Moving workspace state in and out of working directories.
//!
//! The persisted state blob is written to where Terraform expects it before
//! a phase runs and read back afterwards:
//!
//! - default workspace: `terraform.tfstate`
//! - named workspace: `terraform.tfstate.d/<name>/terraform.tfstate`
//! - explicit state path: that path, relative to the working directory

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::backend::WorkspaceContext;

/// State file of the default workspace.
pub const STATE_FILE: &str = "terraform.tfstate";

/// Directory holding the state of named workspaces.
pub const WORKSPACE_STATE_DIR: &str = "terraform.tfstate.d";

/// Errors moving state files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// The file could not be read or written. Worth retrying.
    #[error("State file unavailable: {0}")]
    Unavailable(#[from] std::io::Error),

    /// The file exists but is not a state document.
    #[error("Invalid state file: {0}")]
    Invalid(String),
}

impl StateError {
    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Unavailable(_))
    }
}

/// Result type for state file operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Where Terraform keeps the state for a workspace.
pub fn state_file_path(workspace: &WorkspaceContext) -> PathBuf {
    match &workspace.state_path {
        Some(path) => workspace.working_dir.join(path),
        None if workspace.is_default => workspace.working_dir.join(STATE_FILE),
        None => workspace
            .working_dir
            .join(WORKSPACE_STATE_DIR)
            .join(&workspace.name)
            .join(STATE_FILE),
    }
}

/// Moves state between persistence and a working directory.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write `state` where Terraform will read it. `None` leaves the
    /// working directory untouched.
    async fn materialize(&self, workspace: &WorkspaceContext, state: Option<&str>) -> Result<()>;

    /// Read the state back. `Ok(None)` when no state file exists.
    async fn retrieve(&self, workspace: &WorkspaceContext) -> Result<Option<String>>;
}

/// [`StateStore`] on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStateStore;

#[async_trait]
impl StateStore for FileStateStore {
    async fn materialize(&self, workspace: &WorkspaceContext, state: Option<&str>) -> Result<()> {
        let Some(state) = state else {
            return Ok(());
        };
        let path = state_file_path(workspace);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, state).await?;
        debug!(
            workspace_id = %workspace.workspace_id,
            path = %path.display(),
            bytes = state.len(),
            "State materialized"
        );
        Ok(())
    }

    async fn retrieve(&self, workspace: &WorkspaceContext) -> Result<Option<String>> {
        let path = state_file_path(workspace);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str::<serde_json::Value>(&content)
            .map_err(|e| StateError::Invalid(format!("{}: {}", path.display(), e)))?;
        Ok(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn workspace(dir: &TempDir, name: &str) -> WorkspaceContext {
        WorkspaceContext {
            workspace_id: Uuid::new_v4(),
            name: name.into(),
            is_default: name == "default",
            version: "1.5.7".into(),
            parallelism: None,
            working_dir: dir.path().to_path_buf(),
            state_path: None,
        }
    }

    #[test]
    fn test_state_paths() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            state_file_path(&workspace(&dir, "default")),
            dir.path().join("terraform.tfstate")
        );
        assert_eq!(
            state_file_path(&workspace(&dir, "prod")),
            dir.path().join("terraform.tfstate.d/prod/terraform.tfstate")
        );

        let mut explicit = workspace(&dir, "prod");
        explicit.state_path = Some("states/prod.tfstate".into());
        assert_eq!(
            state_file_path(&explicit),
            dir.path().join("states/prod.tfstate")
        );
    }

    #[tokio::test]
    async fn test_materialize_then_retrieve() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "staging");
        let store = FileStateStore;

        assert_eq!(store.retrieve(&ws).await.unwrap(), None);

        let state = r#"{"version":4,"serial":3,"resources":[]}"#;
        store.materialize(&ws, Some(state)).await.unwrap();
        assert_eq!(store.retrieve(&ws).await.unwrap().as_deref(), Some(state));
    }

    #[tokio::test]
    async fn test_materialize_none_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "default");
        let store = FileStateStore;

        store.materialize(&ws, Some("{}")).await.unwrap();
        store.materialize(&ws, None).await.unwrap();
        assert_eq!(store.retrieve(&ws).await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_garbage_state_is_invalid() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "default");
        tokio::fs::write(dir.path().join(STATE_FILE), "not json")
            .await
            .unwrap();

        let err = FileStateStore.retrieve(&ws).await.unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        assert!(!err.is_transient());
    }
}
