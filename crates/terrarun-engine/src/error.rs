// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for terrarun-engine.

use terrarun_core::models::RunStatus;
use thiserror::Error;
use uuid::Uuid;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Locking is gated off.
    #[error("Lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    /// Backend operation failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Persistence(#[from] terrarun_core::CoreError),

    /// Moving state in or out of the working directory failed.
    #[error("State error: {0}")]
    State(#[from] crate::state_file::StateError),

    /// The workspace lock is held by someone else.
    #[error("Workspace {0} is busy")]
    Conflict(Uuid),

    /// An entity the operation needs does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Requested ID.
        id: Uuid,
    },

    /// The run is not in a status this operation accepts.
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        /// Run ID.
        run_id: Uuid,
        /// Current status.
        status: RunStatus,
        /// Status the operation requires.
        expected: RunStatus,
    },
}

impl EngineError {
    /// Shorthand for [`EngineError::NotFound`].
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// Whether this is a rejection that must not be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_)
                | EngineError::Lock(_)
                | EngineError::Backend(crate::backend::BackendError::CommandConflict { .. })
        )
    }
}

/// Result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
