// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entities and status enums.
//!
//! Statuses are persisted as snake_case text; [`std::str::FromStr`] and
//! [`std::fmt::Display`] round-trip through the same spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Persisted spelling of this status.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::InvalidStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum! {
    /// Status of the plan phase.
    PlanStatus, "plan" {
        /// Waiting to be picked up.
        Queued => "queued",
        /// `terraform plan` exited non-zero or setup failed.
        Failed => "failed",
        /// A planned run was discarded without applying.
        Rejected => "rejected",
        /// Materializing state into the working directory.
        PrePlanning => "pre_planning",
        /// `terraform plan` is running.
        Planning => "planning",
        /// Plan succeeded, retrieving state.
        PostPlanning => "post_planning",
        /// Plan finished and can be applied.
        Planned => "planned",
        /// Running `init` / workspace selection.
        Initializing => "initializing",
    }
}

status_enum! {
    /// Status of the apply phase.
    ApplyStatus, "apply" {
        /// Waiting to be picked up.
        Queued => "queued",
        /// `terraform apply` exited non-zero.
        Failed => "failed",
        /// `terraform apply` is running.
        Applying => "applying",
        /// Apply succeeded and state was retrieved.
        Applied => "applied",
        /// Apply succeeded but the resulting state could not be read.
        AppliedStateError => "applied_state_error",
        /// Apply failed and the resulting state could not be read either.
        FailedStateError => "failed_state_error",
    }
}

status_enum! {
    /// Externally visible status of a run.
    RunStatus, "run" {
        /// Waiting to be picked up.
        Queued => "queued",
        /// Running `init` / workspace selection.
        Initializing => "initializing",
        /// Materializing state before planning.
        PrePlanning => "pre_planning",
        /// `terraform plan` is running.
        Planning => "planning",
        /// Retrieving state after a successful plan.
        PostPlanning => "post_planning",
        /// Plan finished and can be applied.
        Planned => "planned",
        /// Planned run discarded.
        Rejected => "rejected",
        /// `terraform apply` is running.
        Applying => "applying",
        /// Apply succeeded.
        Applied => "applied",
        /// Apply succeeded, state retrieval failed.
        AppliedStateError => "applied_state_error",
        /// Apply failed, state retrieval failed.
        FailedStateError => "failed_state_error",
        /// Plan or apply failed.
        Failed => "failed",
    }
}

impl From<PlanStatus> for RunStatus {
    fn from(status: PlanStatus) -> Self {
        match status {
            PlanStatus::Queued => RunStatus::Queued,
            PlanStatus::Failed => RunStatus::Failed,
            PlanStatus::Rejected => RunStatus::Rejected,
            PlanStatus::PrePlanning => RunStatus::PrePlanning,
            PlanStatus::Planning => RunStatus::Planning,
            PlanStatus::PostPlanning => RunStatus::PostPlanning,
            PlanStatus::Planned => RunStatus::Planned,
            PlanStatus::Initializing => RunStatus::Initializing,
        }
    }
}

impl From<ApplyStatus> for RunStatus {
    fn from(status: ApplyStatus) -> Self {
        match status {
            ApplyStatus::Queued => RunStatus::Queued,
            ApplyStatus::Failed => RunStatus::Failed,
            ApplyStatus::Applying => RunStatus::Applying,
            ApplyStatus::Applied => RunStatus::Applied,
            ApplyStatus::AppliedStateError => RunStatus::AppliedStateError,
            ApplyStatus::FailedStateError => RunStatus::FailedStateError,
        }
    }
}

impl PlanStatus {
    /// Whether `terraform plan` has not been started yet.
    pub fn is_unstarted(self) -> bool {
        matches!(
            self,
            PlanStatus::Queued | PlanStatus::Initializing | PlanStatus::PrePlanning
        )
    }
}

impl RunStatus {
    /// Derive the run status from its phases.
    ///
    /// When an apply exists the plan status is ignored entirely.
    pub fn derive(plan: Option<PlanStatus>, apply: Option<ApplyStatus>) -> RunStatus {
        match (plan, apply) {
            (_, Some(apply)) => apply.into(),
            (Some(plan), None) => plan.into(),
            (None, None) => RunStatus::Queued,
        }
    }

    /// Whether a backend job may exist for a run in this status.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued
                | RunStatus::Initializing
                | RunStatus::PrePlanning
                | RunStatus::Planning
                | RunStatus::PostPlanning
                | RunStatus::Applying
        )
    }

    /// Every status for which [`is_active`](Self::is_active) holds.
    pub const ACTIVE: [RunStatus; 6] = [
        RunStatus::Queued,
        RunStatus::Initializing,
        RunStatus::PrePlanning,
        RunStatus::Planning,
        RunStatus::PostPlanning,
        RunStatus::Applying,
    ];

    /// Whether the run reached a status it never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Rejected
                | RunStatus::Applied
                | RunStatus::AppliedStateError
                | RunStatus::FailedStateError
                | RunStatus::Failed
        )
    }
}

/// A node in the directory hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    /// Directory ID.
    pub id: Uuid,
    /// Parent directory, `None` for a root.
    pub parent_id: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// Terraform version inherited by descendants.
    pub terraform_version: Option<String>,
    /// Parallelism inherited by descendants.
    pub parallelism: Option<i32>,
    /// Azure destroy retry threshold inherited by descendants.
    pub azure_destroy_failure_threshold: Option<i32>,
}

/// One Terraform working directory with its own state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Workspace ID.
    pub id: Uuid,
    /// Owning directory.
    pub directory_id: Uuid,
    /// Terraform workspace name.
    pub name: String,
    /// Whether this is Terraform's `default` workspace.
    pub is_default: bool,
    /// Explicit Terraform version; falls back to the directory ancestry.
    pub terraform_version: Option<String>,
    /// Explicit `-parallelism`; falls back to the directory ancestry.
    pub parallelism: Option<i32>,
    /// Whether the host is resolved dynamically at run time.
    pub dynamic_host: bool,
    /// How many times a failed destroy apply is retried.
    pub azure_destroy_failure_threshold: Option<i32>,
    /// Last time state was successfully pulled back.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Serialized `terraform.tfstate`.
    pub state: Option<String>,
    /// The state that was current before the last sync.
    pub state_backup: Option<String>,
    /// Output of the last failed sync, `None` when the last sync succeeded.
    pub sync_errors: Option<String>,
    /// State file path relative to the working directory, when Terraform
    /// keeps state somewhere other than `terraform.tfstate`.
    pub state_path: Option<String>,
}

impl Workspace {
    /// Create a workspace with no state.
    pub fn new(directory_id: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            directory_id,
            is_default: name == "default",
            name,
            terraform_version: None,
            parallelism: None,
            dynamic_host: false,
            azure_destroy_failure_threshold: None,
            last_synced_at: None,
            state: None,
            state_backup: None,
            sync_errors: None,
            state_path: None,
        }
    }
}

/// Settings of a workspace after directory inheritance was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSettings {
    /// Resolved Terraform version.
    pub terraform_version: Option<String>,
    /// Resolved `-parallelism` value.
    pub parallelism: Option<i32>,
    /// Resolved destroy retry threshold.
    pub azure_destroy_failure_threshold: Option<i32>,
}

impl WorkspaceSettings {
    /// Start from the workspace's own values.
    pub fn from_workspace(workspace: &Workspace) -> Self {
        Self {
            terraform_version: workspace.terraform_version.clone(),
            parallelism: workspace.parallelism,
            azure_destroy_failure_threshold: workspace.azure_destroy_failure_threshold,
        }
    }

    /// Fill unset values from an ancestor directory. Nearest ancestor wins,
    /// so callers walk upwards and values already set are kept.
    pub fn inherit(&mut self, directory: &Directory) {
        if self.terraform_version.is_none() {
            self.terraform_version = directory.terraform_version.clone();
        }
        if self.parallelism.is_none() {
            self.parallelism = directory.parallelism;
        }
        if self.azure_destroy_failure_threshold.is_none() {
            self.azure_destroy_failure_threshold = directory.azure_destroy_failure_threshold;
        }
    }
}

/// A request to change a workspace's infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run ID.
    pub id: Uuid,
    /// Target workspace.
    pub workspace_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Plan with `-destroy`.
    pub is_destroy: bool,
    /// `--target` addresses, in order.
    pub targets: Vec<String>,
    /// `-replace` addresses, in order.
    pub replace_addresses: Vec<String>,
    /// Current status, derived from the plan and apply.
    pub status: RunStatus,
}

impl Run {
    /// Create a queued run for a workspace.
    pub fn new(workspace_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            created_at: Utc::now(),
            is_destroy: false,
            targets: Vec::new(),
            replace_addresses: Vec::new(),
            status: RunStatus::Queued,
        }
    }
}

/// The dry-run phase of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan ID, also used as its output stream id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Current status.
    pub status: PlanStatus,
    /// Captured command output.
    pub output: Option<String>,
}

impl Plan {
    /// Create a queued plan.
    pub fn new(run_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            status: PlanStatus::Queued,
            output: None,
        }
    }
}

/// The execution phase of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apply {
    /// Apply ID, also used as its output stream id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Current status.
    pub status: ApplyStatus,
    /// Captured command output.
    pub output: Option<String>,
}

impl Apply {
    /// Create a queued apply.
    pub fn new(run_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            status: ApplyStatus::Queued,
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_prefers_apply() {
        assert_eq!(
            RunStatus::derive(Some(PlanStatus::Planned), Some(ApplyStatus::Applying)),
            RunStatus::Applying
        );
        assert_eq!(
            RunStatus::derive(Some(PlanStatus::Failed), Some(ApplyStatus::Applied)),
            RunStatus::Applied
        );
    }

    #[test]
    fn test_unstarted_plan_statuses() {
        assert!(PlanStatus::Queued.is_unstarted());
        assert!(PlanStatus::PrePlanning.is_unstarted());
        assert!(!PlanStatus::Planning.is_unstarted());
        assert!(!PlanStatus::Failed.is_unstarted());
    }

    #[test]
    fn test_derive_plan_only() {
        assert_eq!(
            RunStatus::derive(Some(PlanStatus::PostPlanning), None),
            RunStatus::PostPlanning
        );
        assert_eq!(RunStatus::derive(None, None), RunStatus::Queued);
    }

    #[test]
    fn test_apply_status_ignores_every_plan_status() {
        let plans = [
            PlanStatus::Queued,
            PlanStatus::Failed,
            PlanStatus::Rejected,
            PlanStatus::Planned,
            PlanStatus::Planning,
        ];
        for plan in plans {
            assert_eq!(
                RunStatus::derive(Some(plan), Some(ApplyStatus::FailedStateError)),
                RunStatus::FailedStateError
            );
        }
    }

    #[test]
    fn test_active_statuses() {
        assert!(RunStatus::Planning.is_active());
        assert!(RunStatus::Applying.is_active());
        assert!(!RunStatus::Planned.is_active());
        assert!(!RunStatus::Failed.is_active());
        assert!(RunStatus::ACTIVE.iter().all(|s| s.is_active()));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(RunStatus::AppliedStateError.as_str(), "applied_state_error");
        assert_eq!(
            "pre_planning".parse::<PlanStatus>().unwrap(),
            PlanStatus::PrePlanning
        );
        assert!("bogus".parse::<ApplyStatus>().is_err());
    }

    #[test]
    fn test_settings_nearest_ancestor_wins() {
        let mut workspace = Workspace::new(Uuid::new_v4(), "staging");
        workspace.parallelism = Some(4);
        let mut settings = WorkspaceSettings::from_workspace(&workspace);

        let parent = Directory {
            id: workspace.directory_id,
            parent_id: None,
            name: "infra".into(),
            terraform_version: Some("1.5.7".into()),
            parallelism: Some(10),
            azure_destroy_failure_threshold: None,
        };
        let root = Directory {
            id: Uuid::new_v4(),
            parent_id: None,
            name: "root".into(),
            terraform_version: Some("1.3.0".into()),
            parallelism: None,
            azure_destroy_failure_threshold: Some(2),
        };
        settings.inherit(&parent);
        settings.inherit(&root);

        assert_eq!(settings.terraform_version.as_deref(), Some("1.5.7"));
        assert_eq!(settings.parallelism, Some(4));
        assert_eq!(settings.azure_destroy_failure_threshold, Some(2));
    }

    #[test]
    fn test_default_workspace_flag() {
        assert!(Workspace::new(Uuid::new_v4(), "default").is_default);
        assert!(!Workspace::new(Uuid::new_v4(), "prod").is_default);
    }
}
