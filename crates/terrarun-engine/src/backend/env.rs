// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment passed to Terraform.
//!
//! Sources are merged in order, later ones winning on key collision:
//! the static configured environment, the (optionally filtered) process
//! environment, then per-command overrides.

use regex::Regex;
use std::collections::BTreeMap;

/// Always set so Terraform skips interactive hints.
pub const TF_IN_AUTOMATION: &str = "TF_IN_AUTOMATION";

/// Selects the Terraform workspace during `init`.
pub const TF_WORKSPACE: &str = "TF_WORKSPACE";

/// How the backend environment is assembled.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    /// Variables every command receives.
    pub static_env: BTreeMap<String, String>,
    /// Forward the whole process environment.
    pub inherit_all: bool,
    /// When not inheriting everything, forward keys matching any of these.
    pub allow: Vec<Regex>,
}

impl EnvPolicy {
    /// Whether a process variable is forwarded.
    pub fn allows(&self, key: &str) -> bool {
        self.inherit_all || self.allow.iter().any(|re| re.is_match(key))
    }

    /// Merge the configured sources with `process_env` and `overrides`.
    pub fn build<I>(&self, process_env: I, overrides: &[(String, String)]) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env = BTreeMap::new();
        env.insert(TF_IN_AUTOMATION.to_string(), "true".to_string());
        env.extend(self.static_env.clone());
        env.extend(process_env.into_iter().filter(|(key, _)| self.allows(key)));
        env.extend(overrides.iter().cloned());
        env
    }

    /// [`build`](Self::build) against the current process environment.
    pub fn build_from_process(&self, overrides: &[(String, String)]) -> BTreeMap<String, String> {
        self.build(std::env::vars(), overrides)
    }
}

/// Render an environment as `KEY=VALUE` strings.
pub fn to_key_value_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}
