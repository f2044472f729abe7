// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run event queue.
//!
//! Producers push [`RunEvent`]s onto an unbounded FIFO; a single
//! [`RunDispatcher`] pulls them off and hands each one to the handler on its
//! own task, so a slow workspace never delays events for another one.
//! Handler errors end at the task boundary: they are logged and dropped.

use async_trait::async_trait;
use std::sync::Arc;
use terrarun_core::models::{ApplyStatus, PlanStatus};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEvent {
    /// A run was created and needs planning.
    RunCreated {
        /// Run ID.
        run_id: Uuid,
    },
    /// A planned run was confirmed and needs applying.
    ApplyCreated {
        /// Run ID.
        run_id: Uuid,
    },
    /// A planned run was discarded.
    RunRejected {
        /// Run ID.
        run_id: Uuid,
    },
    /// State should be refreshed against real infrastructure.
    RefreshRequested {
        /// Workspace ID.
        workspace_id: Uuid,
    },
}

impl RunEvent {
    /// Event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunCreated { .. } => "run_created",
            RunEvent::ApplyCreated { .. } => "apply_created",
            RunEvent::RunRejected { .. } => "run_rejected",
            RunEvent::RefreshRequested { .. } => "refresh_requested",
        }
    }

    /// The run or workspace the event is about.
    pub fn subject_id(&self) -> Uuid {
        match *self {
            RunEvent::RunCreated { run_id }
            | RunEvent::ApplyCreated { run_id }
            | RunEvent::RunRejected { run_id } => run_id,
            RunEvent::RefreshRequested { workspace_id } => workspace_id,
        }
    }

    /// Event that moves a run nothing is working on to its next phase.
    ///
    /// A queued apply only goes straight to applying once planning has
    /// started; until then the run is planned first and the apply follows.
    /// `None` when the apply is already past the queue.
    pub fn for_waiting_run(
        run_id: Uuid,
        plan: Option<PlanStatus>,
        apply: Option<ApplyStatus>,
    ) -> Option<Self> {
        match (plan, apply) {
            (_, Some(apply)) if apply != ApplyStatus::Queued => None,
            (Some(plan), Some(_)) if !plan.is_unstarted() => Some(RunEvent::ApplyCreated { run_id }),
            _ => Some(RunEvent::RunCreated { run_id }),
        }
    }
}

/// Consumer of run events.
#[async_trait]
pub trait RunEventHandler: Send + Sync {
    /// Process one event to completion.
    async fn handle(&self, event: RunEvent) -> crate::error::Result<()>;
}

/// Producer side of the run queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunQueue {
    sender: mpsc::UnboundedSender<RunEvent>,
}

/// Consumer side of the run queue.
pub type RunQueueReceiver = mpsc::UnboundedReceiver<RunEvent>;

impl RunQueue {
    /// Create a connected queue and receiver.
    pub fn channel() -> (RunQueue, RunQueueReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (RunQueue { sender }, receiver)
    }

    /// Enqueue an event. Never blocks.
    ///
    /// Returns `false` when the dispatcher is gone.
    pub fn add(&self, event: RunEvent) -> bool {
        match self.sender.send(event) {
            Ok(()) => {
                debug!(
                    event = event.kind(),
                    subject_id = %event.subject_id(),
                    "Run event queued"
                );
                true
            }
            Err(_) => {
                warn!(
                    event = event.kind(),
                    subject_id = %event.subject_id(),
                    "Run queue closed, dropping event"
                );
                false
            }
        }
    }
}

/// Single consumer loop of the run queue.
pub struct RunDispatcher {
    receiver: RunQueueReceiver,
    handler: Arc<dyn RunEventHandler>,
    shutdown: Arc<Notify>,
}

impl RunDispatcher {
    /// Create a dispatcher.
    pub fn new(receiver: RunQueueReceiver, handler: Arc<dyn RunEventHandler>) -> Self {
        Self {
            receiver,
            handler,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the dispatch loop until shutdown or until every producer is gone.
    ///
    /// Tasks already spawned keep running after the loop exits.
    pub async fn run(mut self) {
        info!("Run dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Run dispatcher shutting down");
                    break;
                }
                event = self.receiver.recv() => {
                    let Some(event) = event else {
                        info!("Run queue closed, dispatcher exiting");
                        break;
                    };
                    self.dispatch(event);
                }
            }
        }
    }

    fn dispatch(&self, event: RunEvent) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(event).await {
                error!(
                    event = event.kind(),
                    subject_id = %event.subject_id(),
                    error = %e,
                    "Run event handler failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_id() {
        let run_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        assert_eq!(RunEvent::ApplyCreated { run_id }.subject_id(), run_id);
        assert_eq!(
            RunEvent::RefreshRequested { workspace_id }.subject_id(),
            workspace_id
        );
        assert_eq!(RunEvent::RunRejected { run_id }.kind(), "run_rejected");
    }

    #[test]
    fn test_waiting_run_routing() {
        let run_id = Uuid::new_v4();
        let plan = RunEvent::RunCreated { run_id };
        let apply = RunEvent::ApplyCreated { run_id };

        assert_eq!(RunEvent::for_waiting_run(run_id, None, None), Some(plan));
        // An apply without a plan is planned first.
        assert_eq!(
            RunEvent::for_waiting_run(run_id, None, Some(ApplyStatus::Queued)),
            Some(plan)
        );
        assert_eq!(
            RunEvent::for_waiting_run(
                run_id,
                Some(PlanStatus::Initializing),
                Some(ApplyStatus::Queued)
            ),
            Some(plan)
        );
        assert_eq!(
            RunEvent::for_waiting_run(run_id, Some(PlanStatus::Planned), Some(ApplyStatus::Queued)),
            Some(apply)
        );
        // The apply itself refuses a failed plan.
        assert_eq!(
            RunEvent::for_waiting_run(run_id, Some(PlanStatus::Failed), Some(ApplyStatus::Queued)),
            Some(apply)
        );
        assert_eq!(
            RunEvent::for_waiting_run(
                run_id,
                Some(PlanStatus::Planned),
                Some(ApplyStatus::Applying)
            ),
            None
        );
    }

    #[test]
    fn test_add_after_receiver_dropped() {
        let (queue, receiver) = RunQueue::channel();
        assert!(queue.add(RunEvent::RunCreated {
            run_id: Uuid::new_v4()
        }));
        drop(receiver);
        assert!(!queue.add(RunEvent::RunCreated {
            run_id: Uuid::new_v4()
        }));
    }
}
