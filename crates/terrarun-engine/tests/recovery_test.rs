// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup recovery against the mock backend.

mod common;

use common::TestContext;
use terrarun_core::models::{Apply, ApplyStatus, PlanStatus, RunStatus};
use terrarun_engine::backend::MockResponse;
use terrarun_engine::lock::LockTimeout;
use terrarun_engine::queue::{RunEvent, RunQueue};
use terrarun_engine::recovery::RecoveryCoordinator;

#[tokio::test]
async fn test_planning_run_reattaches_to_job() {
    let ctx = TestContext::new().await;
    let (run, _) = ctx.run_with_plan(PlanStatus::Planning).await;
    ctx.backend.seed_active_job(
        ctx.workspace.id,
        "plan",
        MockResponse::success(&["Plan: 2 to add, 0 to change, 0 to destroy."]),
    );
    ctx.state.set_state(r#"{"serial":2}"#);

    let (queue, _receiver) = RunQueue::channel();
    let mut report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;
    assert_eq!(report.resumed, vec![run.id]);
    report.wait().await;
    assert!(report.failed.is_empty());

    assert_eq!(ctx.backend.resumed_jobs(), 1);
    assert_eq!(ctx.backend.created_jobs(), 0);
    assert_eq!(ctx.run(run.id).await.status, RunStatus::Planned);
    let plan = ctx.plan(run.id).await;
    assert_eq!(
        plan.output.as_deref(),
        Some("Plan: 2 to add, 0 to change, 0 to destroy.")
    );
    assert_eq!(
        ctx.stored_workspace().await.state.as_deref(),
        Some(r#"{"serial":2}"#)
    );
    // A resumed phase must not re-run init or rewrite the state file.
    assert!(ctx.state.materialized().is_empty());
    assert!(!ctx.locks.is_workspace_locked(ctx.workspace.id));
}

#[tokio::test]
async fn test_applying_run_reattaches_to_job() {
    let ctx = TestContext::new().await;
    let (run, _) = ctx.run_with_apply(ApplyStatus::Applying).await;
    ctx.backend.seed_active_job(
        ctx.workspace.id,
        "apply",
        MockResponse::success(&["Apply complete! Resources: 2 added, 0 changed, 0 destroyed."]),
    );
    ctx.state.set_state(r#"{"serial":3}"#);

    let (queue, _receiver) = RunQueue::channel();
    let mut report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;
    report.wait().await;

    assert_eq!(ctx.backend.resumed_jobs(), 1);
    assert_eq!(ctx.backend.created_jobs(), 0);
    assert_eq!(ctx.run(run.id).await.status, RunStatus::Applied);
    assert_eq!(ctx.apply(run.id).await.status, ApplyStatus::Applied);
    assert_eq!(
        ctx.stored_workspace().await.state.as_deref(),
        Some(r#"{"serial":3}"#)
    );
}

#[tokio::test]
async fn test_run_without_job_completes_from_state() {
    let ctx = TestContext::new().await;
    let (run, _) = ctx.run_with_plan(PlanStatus::Planning).await;
    ctx.state.set_state(r#"{"serial":6}"#);

    let (queue, _receiver) = RunQueue::channel();
    let mut report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;
    report.wait().await;

    assert_eq!(ctx.backend.resumed_jobs(), 0);
    assert_eq!(ctx.backend.created_jobs(), 0);
    assert_eq!(ctx.run(run.id).await.status, RunStatus::Planned);
    assert_eq!(
        ctx.stored_workspace().await.state.as_deref(),
        Some(r#"{"serial":6}"#)
    );
}

#[tokio::test]
async fn test_orphaned_job_is_reconciled() {
    let ctx = TestContext::new().await;
    ctx.backend.seed_active_job(
        ctx.workspace.id,
        "apply",
        MockResponse::success(&["Apply complete! Resources: 0 added, 1 changed, 0 destroyed."]),
    );
    ctx.state.set_state(r#"{"serial":11}"#);

    let (queue, _receiver) = RunQueue::channel();
    let mut report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;
    assert_eq!(report.orphans_reconciled, vec![ctx.workspace.id]);
    report.wait().await;
    assert!(report.failed.is_empty());

    assert!(!ctx.locks.is_workspace_locked(ctx.workspace.id));
    let workspace = ctx.stored_workspace().await;
    assert_eq!(workspace.state.as_deref(), Some(r#"{"serial":11}"#));
    assert_ne!(workspace.state, ctx.workspace.state);
    assert_eq!(ctx.backend.resumed_jobs(), 1);
}

#[tokio::test]
async fn test_busy_workspace_is_skipped() {
    let ctx = TestContext::new().await;
    let (run, _) = ctx.run_with_plan(PlanStatus::Planning).await;
    ctx.backend
        .seed_active_job(ctx.workspace.id, "plan", MockResponse::success(&[]));
    let held = ctx
        .orchestrator
        .lock_workspace(ctx.workspace.id, LockTimeout::Immediate)
        .await
        .unwrap();

    let (queue, _receiver) = RunQueue::channel();
    let report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;

    assert_eq!(report.skipped, vec![run.id]);
    assert!(report.resumed.is_empty());
    assert!(!report.has_pending_tasks());
    assert_eq!(ctx.backend.resumed_jobs(), 0);
    assert_eq!(ctx.run(run.id).await.status, RunStatus::Planning);
    drop(held);
}

#[tokio::test]
async fn test_unstarted_runs_are_redispatched() {
    let ctx = TestContext::new().await;
    let fresh = ctx.queued_run().await;
    let (initializing, _) = ctx.run_with_plan(PlanStatus::Initializing).await;
    let (confirmed, _) = ctx.run_with_apply(ApplyStatus::Queued).await;
    let (done, _) = ctx.run_with_plan(PlanStatus::Planned).await;
    let unplanned = ctx.queued_run().await;
    ctx.persistence.insert_apply(Apply::new(unplanned.id)).await;

    let (queue, mut receiver) = RunQueue::channel();
    let report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;

    assert_eq!(report.redispatched.len(), 4);
    assert!(!report.redispatched.contains(&done.id));

    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 4);
    assert!(events.contains(&RunEvent::RunCreated { run_id: fresh.id }));
    assert!(events.contains(&RunEvent::RunCreated {
        run_id: initializing.id
    }));
    assert!(events.contains(&RunEvent::ApplyCreated {
        run_id: confirmed.id
    }));
    // Confirmed before planning: planned first.
    assert!(events.contains(&RunEvent::RunCreated {
        run_id: unplanned.id
    }));
    assert!(ctx.backend.invocations().is_empty());
}

#[tokio::test]
async fn test_leftover_commands_are_swept_first() {
    let ctx = TestContext::new().await;
    ctx.backend.seed_leftovers(2);

    let (queue, _receiver) = RunQueue::channel();
    let report = RecoveryCoordinator::new(ctx.orchestrator.clone(), queue)
        .recover()
        .await;

    assert_eq!(ctx.backend.sweeps(), 1);
    assert_eq!(report.leftovers_removed, 2);
    assert!(report.failed.is_empty());
}
