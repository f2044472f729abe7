// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the terrarun daemon.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::{
    ContainerBackendConfig, EnvPolicy, LocalBackendConfig, ensure_absolute_path,
};
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;

/// Which execution backend runs Terraform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Child processes on this host.
    Local,
    /// Containers through the Docker Engine API.
    Container,
}

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL; in-memory persistence when unset.
    pub database_url: Option<String>,
    /// Execution backend.
    pub backend: BackendKind,
    /// Root for workspace working directories and installed binaries.
    /// Always absolute.
    pub data_dir: PathBuf,
    /// Where the local backend finds `<version>/terraform`.
    pub binary_dir: PathBuf,
    /// Version used when no workspace or directory names one.
    pub default_version: Option<String>,
    /// Image repository for the container backend.
    pub container_image: String,
    /// Mount point of the workspaces directory inside containers.
    pub container_root: String,
    /// Value of the `app` container label.
    pub app_name: String,
    /// Only image tags matching this are offered as versions.
    pub version_tag_regex: Option<Regex>,
    /// Forward the whole process environment to Terraform.
    pub inherit_env: bool,
    /// Process variables forwarded when not inheriting everything.
    pub env_allow: Vec<Regex>,
    /// Variables every Terraform command receives.
    pub extra_env: BTreeMap<String, String>,
    /// Ceiling for retry backoff.
    pub retry_ceiling: Duration,
    /// How often queued runs are polled.
    pub scheduler_poll_interval: Duration,
    /// How long finished output stays readable while it has subscribers.
    pub output_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `TERRARUN_DATABASE_URL` - PostgreSQL URL (default: in-memory)
    /// - `TERRARUN_BACKEND` - `local` or `container` (default: local)
    /// - `DATA_DIR` - Data directory (default: .data)
    /// - `TERRARUN_BINARY_DIR` - Terraform binaries (default: `<DATA_DIR>/bin`)
    /// - `TERRARUN_DEFAULT_VERSION` - Fallback Terraform version
    /// - `TERRARUN_CONTAINER_IMAGE` - Image repository (default: hashicorp/terraform)
    /// - `TERRARUN_CONTAINER_ROOT` - Container mount point (default: /workspaces)
    /// - `TERRARUN_APP_NAME` - Container `app` label (default: terrarun)
    /// - `TERRARUN_VERSION_TAG_REGEX` - Filter for image tags
    /// - `TERRARUN_INHERIT_ENV` - Forward the whole environment (default: false)
    /// - `TERRARUN_ENV_ALLOW` - Comma-separated regexes of forwarded variables
    /// - `TERRARUN_EXTRA_ENV` - `KEY=VALUE,KEY=VALUE` passed to every command
    /// - `TERRARUN_RETRY_CEILING_SECS` - Backoff ceiling (default: 60)
    /// - `TERRARUN_SCHEDULER_POLL_SECS` - Queued run poll interval (default: 5)
    /// - `TERRARUN_OUTPUT_RETENTION_SECS` - Finished output kept for readers (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var("TERRARUN_BACKEND").as_deref() {
            None | Some("local") => BackendKind::Local,
            Some("container") | Some("docker") => BackendKind::Container,
            Some(other) => {
                return Err(ConfigError::Invalid(
                    "TERRARUN_BACKEND",
                    format!("unknown backend '{other}', expected local or container"),
                ));
            }
        };

        let data_dir = ensure_absolute_path(PathBuf::from(
            var("DATA_DIR").unwrap_or_else(|| ".data".to_string()),
        ));
        let binary_dir = var("TERRARUN_BINARY_DIR")
            .map(|dir| ensure_absolute_path(PathBuf::from(dir)))
            .unwrap_or_else(|| data_dir.join("bin"));

        let version_tag_regex = var("TERRARUN_VERSION_TAG_REGEX")
            .map(|pattern| parse_regex("TERRARUN_VERSION_TAG_REGEX", &pattern))
            .transpose()?;

        let env_allow = var("TERRARUN_ENV_ALLOW")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| parse_regex("TERRARUN_ENV_ALLOW", p))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let extra_env = match var("TERRARUN_EXTRA_ENV") {
            Some(list) => parse_key_values(&list)?,
            None => BTreeMap::new(),
        };

        let inherit_env = var("TERRARUN_INHERIT_ENV")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let retry_ceiling = parse_secs(var("TERRARUN_RETRY_CEILING_SECS"), "TERRARUN_RETRY_CEILING_SECS", 60)?;
        let scheduler_poll_interval =
            parse_secs(var("TERRARUN_SCHEDULER_POLL_SECS"), "TERRARUN_SCHEDULER_POLL_SECS", 5)?;
        let output_retention =
            parse_secs(var("TERRARUN_OUTPUT_RETENTION_SECS"), "TERRARUN_OUTPUT_RETENTION_SECS", 60)?;

        Ok(Self {
            database_url: var("TERRARUN_DATABASE_URL"),
            backend,
            data_dir,
            binary_dir,
            default_version: var("TERRARUN_DEFAULT_VERSION"),
            container_image: var("TERRARUN_CONTAINER_IMAGE")
                .unwrap_or_else(|| "hashicorp/terraform".to_string()),
            container_root: var("TERRARUN_CONTAINER_ROOT")
                .unwrap_or_else(|| "/workspaces".to_string()),
            app_name: var("TERRARUN_APP_NAME").unwrap_or_else(|| "terrarun".to_string()),
            version_tag_regex,
            inherit_env,
            env_allow,
            extra_env,
            retry_ceiling,
            scheduler_poll_interval,
            output_retention,
        })
    }

    /// Host directory holding one working directory per workspace.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    /// Backoff shared by backends and the orchestrator.
    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = RetryPolicy::default().initial.min(self.retry_ceiling);
        RetryPolicy::new(initial, self.retry_ceiling)
    }

    /// Environment forwarded to Terraform.
    pub fn env_policy(&self) -> EnvPolicy {
        EnvPolicy {
            static_env: self.extra_env.clone(),
            inherit_all: self.inherit_env,
            allow: self.env_allow.clone(),
        }
    }

    /// Settings for [`crate::backend::LocalBackend`].
    pub fn local_backend(&self) -> LocalBackendConfig {
        LocalBackendConfig {
            binary_dir: self.binary_dir.clone(),
            env: self.env_policy(),
            retry: self.retry_policy(),
        }
    }

    /// Settings for [`crate::backend::ContainerBackend`].
    pub fn container_backend(&self) -> ContainerBackendConfig {
        ContainerBackendConfig {
            image: self.container_image.clone(),
            app_name: self.app_name.clone(),
            host_workspaces_dir: self.workspaces_dir(),
            container_root: self.container_root.clone(),
            env: self.env_policy(),
            retry: self.retry_policy(),
            version_filter: self.version_tag_regex.clone(),
            ..ContainerBackendConfig::default()
        }
    }

    /// Settings for [`crate::orchestrator::RunOrchestrator`].
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workspaces_root: self.workspaces_dir(),
            default_version: self.default_version.clone(),
            retry: self.retry_policy(),
            output_retention: self.output_retention,
            ..OrchestratorConfig::default()
        }
    }
}

fn parse_regex(var: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::Invalid(var, e.to_string()))
}

fn parse_secs(value: Option<String>, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(Duration::from_secs(default));
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid(var, "must be greater than zero".to_string())),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(ConfigError::Invalid(var, format!("'{value}' is not a number of seconds"))),
    }
}

fn parse_key_values(list: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(ConfigError::Invalid(
                "TERRARUN_EXTRA_ENV",
                format!("'{pair}' is not KEY=VALUE"),
            )),
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
