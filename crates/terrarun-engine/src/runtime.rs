// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the run engine.
//!
//! [`EngineRuntime`] wires persistence, a backend and the shared lock and
//! output registries into a running engine: startup recovery first, then the
//! queue dispatcher and the queued run scheduler.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use terrarun_core::persistence::MemoryPersistence;
//! use terrarun_engine::backend::{LocalBackend, LocalBackendConfig};
//! use terrarun_engine::queue::RunEvent;
//! use terrarun_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EngineRuntime::builder()
//!         .persistence(Arc::new(MemoryPersistence::new()))
//!         .backend(Arc::new(LocalBackend::new(LocalBackendConfig::default())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.queue().add(RunEvent::RunCreated { run_id });
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use terrarun_core::persistence::Persistence;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::{ExecutionBackend, TerraformCommands};
use crate::lock::LockRegistry;
use crate::orchestrator::{OrchestratorConfig, RunOrchestrator};
use crate::output::OutputRegistry;
use crate::queue::{RunDispatcher, RunQueue};
use crate::recovery::{RecoveryCoordinator, RecoveryReport};
use crate::scheduler::{QueuedRunScheduler, QueuedRunSchedulerConfig};
use crate::state_file::{FileStateStore, StateStore};

/// Builder for an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    state_store: Option<Arc<dyn StateStore>>,
    locks: Option<Arc<LockRegistry>>,
    orchestrator: OrchestratorConfig,
    scheduler_poll_interval: Option<Duration>,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            backend: None,
            state_store: None,
            locks: None,
            orchestrator: OrchestratorConfig::default(),
            scheduler_poll_interval: Some(QueuedRunSchedulerConfig::default().poll_interval),
        }
    }
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field(
                "backend",
                &self.backend.as_ref().map(|b| b.backend_type()),
            )
            .field("state_store", &self.state_store.as_ref().map(|_| "..."))
            .field("orchestrator", &self.orchestrator)
            .field("scheduler_poll_interval", &self.scheduler_poll_interval)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the execution backend (required).
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set how state files are written and read.
    ///
    /// Default: [`FileStateStore`]
    pub fn state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    /// Share a lock registry with other components.
    ///
    /// Default: a fresh registry
    pub fn locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the orchestrator configuration.
    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = config;
        self
    }

    /// Set the queued run scheduler poll interval.
    ///
    /// Default: 5 seconds
    pub fn scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = Some(interval);
        self
    }

    /// Do not start the queued run scheduler; runs are only picked up from
    /// explicit queue events and recovery.
    pub fn disable_scheduler(mut self) -> Self {
        self.scheduler_poll_interval = None;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;

        Ok(EngineRuntimeConfig {
            persistence,
            backend,
            state_store: self
                .state_store
                .unwrap_or_else(|| Arc::new(FileStateStore)),
            locks: self.locks.unwrap_or_default(),
            orchestrator: self.orchestrator,
            scheduler_poll_interval: self.scheduler_poll_interval,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    backend: Arc<dyn ExecutionBackend>,
    state_store: Arc<dyn StateStore>,
    locks: Arc<LockRegistry>,
    orchestrator: OrchestratorConfig,
    scheduler_poll_interval: Option<Duration>,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("backend", &self.backend.backend_type())
            .field("state_store", &"...")
            .field("locks", &self.locks)
            .field("orchestrator", &self.orchestrator)
            .field("scheduler_poll_interval", &self.scheduler_poll_interval)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime.
    ///
    /// Recovery runs to the point where every lock it needs is held before
    /// the dispatcher starts taking events.
    pub async fn start(self) -> Result<EngineRuntime> {
        let backend_type = self.backend.backend_type();
        let outputs = Arc::new(OutputRegistry::new());
        let orchestrator = Arc::new(RunOrchestrator::new(
            self.persistence.clone(),
            TerraformCommands::new(self.backend),
            self.state_store,
            self.locks.clone(),
            outputs.clone(),
            self.orchestrator,
        ));
        let (queue, receiver) = RunQueue::channel();

        let recovery = RecoveryCoordinator::new(orchestrator.clone(), queue.clone())
            .recover()
            .await;

        let dispatcher = RunDispatcher::new(receiver, orchestrator.clone());
        let dispatcher_shutdown = dispatcher.shutdown_handle();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let scheduler = self.scheduler_poll_interval.map(|poll_interval| {
            let scheduler = QueuedRunScheduler::new(
                self.persistence.clone(),
                queue.clone(),
                QueuedRunSchedulerConfig { poll_interval },
            );
            let shutdown = scheduler.shutdown_handle();
            let handle = tokio::spawn(async move {
                scheduler.run().await;
            });
            (handle, shutdown)
        });

        info!(
            backend = backend_type,
            resumed = recovery.resumed.len(),
            redispatched = recovery.redispatched.len(),
            orphans = recovery.orphans_reconciled.len(),
            scheduler = scheduler.is_some(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            dispatcher_handle,
            dispatcher_shutdown,
            scheduler,
            queue,
            orchestrator,
            locks: self.locks,
            outputs,
            recovery: Mutex::new(recovery),
        })
    }
}

/// A running engine.
///
/// The runtime manages:
/// - The run queue dispatcher feeding the orchestrator
/// - The queued run scheduler (unless disabled)
/// - Background tasks re-attached to jobs by startup recovery
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    dispatcher_handle: JoinHandle<()>,
    dispatcher_shutdown: Arc<Notify>,
    scheduler: Option<(JoinHandle<()>, Arc<Notify>)>,
    queue: RunQueue,
    orchestrator: Arc<RunOrchestrator>,
    locks: Arc<LockRegistry>,
    outputs: Arc<OutputRegistry>,
    recovery: Mutex<RecoveryReport>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Producer side of the run queue.
    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    /// The orchestrator, for one-shot commands and cancellation.
    pub fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.orchestrator
    }

    /// The shared lock registry.
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Live plan and apply output.
    pub fn outputs(&self) -> &Arc<OutputRegistry> {
        &self.outputs
    }

    /// Wait for jobs re-attached by startup recovery and return what the
    /// recovery pass did.
    pub async fn wait_for_recovery(&self) -> RecoveryReport {
        let mut report = self.recovery.lock().await;
        report.wait().await;
        report.summary()
    }

    /// Whether the dispatcher is still running.
    pub fn is_running(&self) -> bool {
        !self.dispatcher_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the dispatcher and scheduler and disables workspace locking so
    /// queued phases give up. Jobs already running are left to the backend;
    /// the next start recovers them.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.locks.disable_workspace_locking();
        self.dispatcher_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.scheduler {
            shutdown.notify_one();
        }

        if let Err(e) = self.dispatcher_handle.await {
            error!("Run dispatcher task panicked: {}", e);
        }
        if let Some((handle, _)) = self.scheduler
            && let Err(e) = handle.await
        {
            error!("Queued run scheduler task panicked: {}", e);
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
