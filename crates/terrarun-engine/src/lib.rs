// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terrarun Engine - Terraform Run Execution & Recovery
//!
//! This crate executes Terraform runs against workspaces and survives
//! restarts of the process driving them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │            Producers (API writing rows, CLI, scheduler)              │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                  │ RunEvent
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  RunQueue ──► RunDispatcher ──► RunOrchestrator (one task per event) │
//! │                                   │          │                       │
//! │                          LockRegistry   OutputRegistry               │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                  │ init / plan / apply jobs
//!                                  ▼
//! ┌─────────────────────────────┐       ┌────────────────────────────────┐
//! │ LocalBackend (child procs)  │  or   │ ContainerBackend (Docker API)  │
//! └─────────────────────────────┘       └────────────────────────────────┘
//!                                  │ finalizer: state + status commit
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │              Persistence (PostgreSQL or in-memory)                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one mutating Terraform operation per workspace at a time
//! - A job's resulting state is always persisted, retrying until it lands
//! - A run's status and its phase status change in the same commit
//! - After a restart, live jobs are re-attached rather than started again
//!
//! # Backends
//!
//! | Backend | Survives a restart | Notes |
//! |---------|--------------------|-------|
//! | [`backend::LocalBackend`] | No | Jobs die with the process; recovery re-plans |
//! | [`backend::ContainerBackend`] | Yes | Jobs found by label and re-attached |
//! | [`backend::MockBackend`] | In-process | Scripted responses for tests |

#![deny(missing_docs)]

/// Execution backends and the Terraform commands built on them.
pub mod backend;
/// Environment-based daemon configuration.
pub mod config;
/// Engine error type.
pub mod error;
/// Workspace and file locks.
pub mod lock;
/// Run phase orchestration.
pub mod orchestrator;
/// Live output broadcasting.
pub mod output;
/// Run event queue and dispatcher.
pub mod queue;
/// Startup recovery.
pub mod recovery;
/// Capped exponential backoff.
pub mod retry;
/// Embeddable runtime.
pub mod runtime;
/// Queued run polling.
pub mod scheduler;
/// Terraform state files on disk.
pub mod state_file;

pub use error::{EngineError, Result};
