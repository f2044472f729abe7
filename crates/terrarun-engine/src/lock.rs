// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-workspace and per-file asynchronous locks.
//!
//! [`AsyncMutex`] is a single-holder lock with FIFO waiters. Acquisition
//! returns a [`LockResult`]; dropping it releases the lock, so a lock can never
//! outlive the scope that took it, whether that scope returns early, errors
//! or panics.
//!
//! The mutex is not re-entrant: acquiring it twice from the same flow waits
//! on itself forever.
//!
//! [`LockRegistry`] lazily creates one mutex per id and owns the maintenance
//! gate for workspace locks.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Workspace locking is disabled while maintenance is in progress.
    #[error("Workspace locking is disabled for maintenance")]
    MaintenanceMode,

    /// The underlying semaphore was closed.
    #[error("Lock was closed")]
    Closed,
}

/// How long [`AsyncMutex::acquire`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    /// Try once and fail immediately if the lock is held.
    Immediate,
    /// Wait up to the given duration.
    After(Duration),
    /// Wait until the lock is granted.
    Infinite,
}

impl LockTimeout {
    /// Interpret a millisecond timeout: `0` tries once, negative waits forever.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => LockTimeout::Immediate,
            ms if ms < 0 => LockTimeout::Infinite,
            ms => LockTimeout::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}

/// Outcome of an acquisition attempt. Holds the lock until dropped.
#[must_use = "dropping the result releases the lock immediately"]
#[derive(Debug)]
pub struct LockResult {
    permit: Option<OwnedSemaphorePermit>,
}

impl LockResult {
    /// Whether the lock was granted.
    pub fn acquired_lock(&self) -> bool {
        self.permit.is_some()
    }

    /// Release the lock now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

/// Single-holder, FIFO-fair asynchronous lock.
#[derive(Debug)]
pub struct AsyncMutex {
    semaphore: Arc<Semaphore>,
    gate: Option<Arc<watch::Sender<bool>>>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    /// Create an ungated mutex.
    pub fn new() -> Self {
        Self {
            // tokio's semaphore grants permits in request order.
            semaphore: Arc::new(Semaphore::new(1)),
            gate: None,
        }
    }

    /// Create a mutex whose waiters fail once `gate` flips to `false`.
    fn gated(gate: Arc<watch::Sender<bool>>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            gate: Some(gate),
        }
    }

    /// Whether some caller currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Acquire the lock.
    ///
    /// Timing out is not an error: the returned result reports
    /// `acquired_lock() == false`.
    pub async fn acquire(&self, timeout: LockTimeout) -> Result<LockResult, LockError> {
        self.check_gate()?;

        let permit = match timeout {
            LockTimeout::Immediate => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => None,
                Err(TryAcquireError::Closed) => return Err(LockError::Closed),
            },
            LockTimeout::After(duration) => {
                match tokio::time::timeout(duration, self.wait()).await {
                    Ok(permit) => Some(permit?),
                    Err(_) => None,
                }
            }
            LockTimeout::Infinite => Some(self.wait().await?),
        };

        Ok(LockResult { permit })
    }

    fn check_gate(&self) -> Result<(), LockError> {
        match &self.gate {
            Some(gate) if !*gate.borrow() => Err(LockError::MaintenanceMode),
            _ => Ok(()),
        }
    }

    async fn wait(&self) -> Result<OwnedSemaphorePermit, LockError> {
        let acquire = self.semaphore.clone().acquire_owned();
        let Some(gate) = &self.gate else {
            return acquire.await.map_err(|_| LockError::Closed);
        };

        let mut enabled = gate.subscribe();
        tokio::select! {
            biased;
            permit = acquire => permit.map_err(|_| LockError::Closed),
            _ = enabled.wait_for(|enabled| !enabled) => Err(LockError::MaintenanceMode),
        }
    }
}

/// Owns every workspace and file lock in the process.
///
/// Entries are never removed; the number of ids is bounded by the number of
/// workspaces and files, not by request volume.
#[derive(Debug)]
pub struct LockRegistry {
    workspaces: DashMap<Uuid, Arc<AsyncMutex>>,
    files: DashMap<Uuid, Arc<AsyncMutex>>,
    workspace_locking: Arc<watch::Sender<bool>>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    /// Create a registry with workspace locking enabled.
    pub fn new() -> Self {
        let (workspace_locking, _) = watch::channel(true);
        Self {
            workspaces: DashMap::new(),
            files: DashMap::new(),
            workspace_locking: Arc::new(workspace_locking),
        }
    }

    /// Get (or lazily create) the lock for a workspace.
    pub fn workspace_lock(&self, workspace_id: Uuid) -> Result<Arc<AsyncMutex>, LockError> {
        if !self.is_workspace_locking_enabled() {
            return Err(LockError::MaintenanceMode);
        }
        Ok(self
            .workspaces
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(AsyncMutex::gated(self.workspace_locking.clone())))
            .value()
            .clone())
    }

    /// Get (or lazily create) the lock for a file. Not affected by maintenance.
    pub fn file_lock(&self, file_id: Uuid) -> Arc<AsyncMutex> {
        self.files
            .entry(file_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new()))
            .value()
            .clone()
    }

    /// Allow workspace locks to be handed out again.
    pub fn enable_workspace_locking(&self) {
        self.workspace_locking.send_replace(true);
        info!("Workspace locking enabled");
    }

    /// Stop handing out workspace locks.
    ///
    /// Holders keep their locks; callers still queued fail with
    /// [`LockError::MaintenanceMode`].
    pub fn disable_workspace_locking(&self) {
        self.workspace_locking.send_replace(false);
        info!(
            workspace_locks = self.workspaces.len(),
            "Workspace locking disabled"
        );
    }

    /// Whether workspace locks can currently be acquired.
    pub fn is_workspace_locking_enabled(&self) -> bool {
        *self.workspace_locking.borrow()
    }

    /// Whether a workspace lock exists and is currently held.
    pub fn is_workspace_locked(&self, workspace_id: Uuid) -> bool {
        let locked = self
            .workspaces
            .get(&workspace_id)
            .is_some_and(|lock| lock.is_locked());
        debug!(workspace_id = %workspace_id, locked, "Checked workspace lock");
        locked
    }
}
