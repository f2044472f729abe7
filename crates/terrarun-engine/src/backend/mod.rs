// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backends.
//!
//! This module provides the backend abstraction the orchestrator runs
//! Terraform through:
//! - `LocalBackend`: child process per command (no restart recovery)
//! - `ContainerBackend`: Docker container per command, re-attachable
//! - `MockBackend`: scripted, in-memory

pub mod args;
pub mod container;
pub mod env;
pub mod local;
pub mod mock;
mod terraform;
mod traits;
pub mod versions;

pub use args::PlanRequest;
pub use container::{ContainerBackend, ContainerBackendConfig};
pub use env::EnvPolicy;
pub use local::{LocalBackend, LocalBackendConfig};
pub use mock::{MockBackend, MockResponse};
pub use terraform::TerraformCommands;
pub use traits::*;
