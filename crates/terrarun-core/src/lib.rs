// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terrarun Core - data model and persistence for Terraform run execution
//!
//! This crate holds the entities the run engine reads and mutates:
//!
//! - **Workspaces**: a Terraform working directory with its own state blob
//! - **Directories**: the hierarchy workspaces live in; carries inheritable settings
//! - **Runs**: one request to plan and optionally apply changes to a workspace
//! - **Plans / Applies**: the two phases of a run, each with its own status and output
//!
//! # Status derivation
//!
//! A run's status is never stored independently of its phases: once an apply
//! exists the run mirrors the apply status, otherwise it mirrors the plan
//! status. See [`models::RunStatus::derive`].
//!
//! # Persistence
//!
//! The engine talks to storage exclusively through the
//! [`persistence::Persistence`] trait. Two implementations ship with the crate:
//!
//! - [`persistence::MemoryPersistence`] for tests and database-less deployments
//! - [`persistence::PostgresPersistence`] backed by sqlx, with embedded
//!   [`migrations`]

#![deny(missing_docs)]

/// Error types for persistence and model conversion.
pub mod error;
/// Database migrations.
pub mod migrations;
/// Workspace, run, plan and apply entities plus status enums.
pub mod models;
/// Persistence trait and its implementations.
pub mod persistence;

pub use error::{CoreError, Result};
