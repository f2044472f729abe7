// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queued run scheduler.
//!
//! Periodically polls persistence for queued runs and puts them on the run
//! queue, so runs created by another process (an API writing rows) get
//! picked up without an explicit event. Re-enqueueing a run that is already
//! being handled is harmless: the orchestrator drops duplicate events.

use std::sync::Arc;
use std::time::Duration;
use terrarun_core::models::RunStatus;
use terrarun_core::persistence::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::queue::{RunEvent, RunQueue};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct QueuedRunSchedulerConfig {
    /// How often to poll for queued runs.
    pub poll_interval: Duration,
}

impl Default for QueuedRunSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Background task feeding queued runs to the run queue.
pub struct QueuedRunScheduler {
    persistence: Arc<dyn Persistence>,
    queue: RunQueue,
    config: QueuedRunSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl QueuedRunScheduler {
    /// Create a scheduler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        queue: RunQueue,
        config: QueuedRunSchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Queued run scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Queued run scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.enqueue_queued_runs().await {
                        error!(error = %e, "Failed to enqueue queued runs");
                    }
                }
            }
        }
    }

    /// Enqueue every queued run once. Returns how many were enqueued.
    pub async fn enqueue_queued_runs(&self) -> Result<usize> {
        let runs = self
            .persistence
            .list_runs_by_status(&[RunStatus::Queued])
            .await?;
        if runs.is_empty() {
            debug!("No queued runs");
            return Ok(0);
        }

        let mut enqueued = 0;
        for run in runs {
            let plan = self.persistence.get_plan_for_run(run.id).await?;
            let apply = self.persistence.get_apply_for_run(run.id).await?;
            let Some(event) = RunEvent::for_waiting_run(
                run.id,
                plan.map(|p| p.status),
                apply.map(|a| a.status),
            ) else {
                continue;
            };
            if self.queue.add(event) {
                enqueued += 1;
            }
        }

        debug!(count = enqueued, "Queued runs enqueued");
        Ok(enqueued)
    }
}
