// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run queue dispatch.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use terrarun_engine::EngineError;
use terrarun_engine::queue::{RunDispatcher, RunEvent, RunEventHandler, RunQueue};
use tokio::sync::Notify;
use uuid::Uuid;

/// Records events; blocks on `gate` for the run it is told to stall.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<RunEvent>>,
    stalled: Mutex<Option<Uuid>>,
    gate: Notify,
}

#[async_trait]
impl RunEventHandler for RecordingHandler {
    async fn handle(&self, event: RunEvent) -> terrarun_engine::Result<()> {
        let stall = *self.stalled.lock() == Some(event.subject_id());
        if stall {
            self.gate.notified().await;
        }
        self.seen.lock().push(event);
        if let RunEvent::RunRejected { run_id } = event {
            return Err(EngineError::not_found("run", run_id));
        }
        Ok(())
    }
}

async fn wait_for_seen(handler: &RecordingHandler, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.seen.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_slow_event_does_not_block_others() {
    let handler = Arc::new(RecordingHandler::default());
    let slow = Uuid::new_v4();
    let fast = Uuid::new_v4();
    *handler.stalled.lock() = Some(slow);

    let (queue, receiver) = RunQueue::channel();
    let dispatcher = RunDispatcher::new(receiver, handler.clone());
    let shutdown = dispatcher.shutdown_handle();
    let task = tokio::spawn(dispatcher.run());

    queue.add(RunEvent::RunCreated { run_id: slow });
    queue.add(RunEvent::RunCreated { run_id: fast });

    wait_for_seen(&handler, 1).await;
    assert_eq!(
        *handler.seen.lock(),
        vec![RunEvent::RunCreated { run_id: fast }]
    );

    handler.gate.notify_one();
    wait_for_seen(&handler, 2).await;

    shutdown.notify_one();
    task.await.unwrap();
}

#[tokio::test]
async fn test_handler_error_does_not_stop_dispatcher() {
    let handler = Arc::new(RecordingHandler::default());
    let (queue, receiver) = RunQueue::channel();
    let task = tokio::spawn(RunDispatcher::new(receiver, handler.clone()).run());

    queue.add(RunEvent::RunRejected {
        run_id: Uuid::new_v4(),
    });
    queue.add(RunEvent::RefreshRequested {
        workspace_id: Uuid::new_v4(),
    });
    wait_for_seen(&handler, 2).await;

    // Dropping every producer ends the loop.
    drop(queue);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
