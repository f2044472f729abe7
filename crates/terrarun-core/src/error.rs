// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for terrarun-core.

use thiserror::Error;
use uuid::Uuid;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Entity was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity (workspace, run, plan, apply, directory).
        entity: &'static str,
        /// The missing identifier.
        id: Uuid,
    },

    /// A persisted status string did not match any known status.
    #[error("Invalid {kind} status: {value}")]
    InvalidStatus {
        /// Which status enum was being parsed.
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// Directory ancestry contains a cycle.
    #[error("Directory hierarchy cycle detected at {0}")]
    DirectoryCycle(Uuid),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Shorthand for a [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether this error means the entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
