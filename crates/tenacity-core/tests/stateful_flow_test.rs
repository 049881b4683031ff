// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The auxiliary-state scrapbook: persisted after every attempt, restored
//! before the next one, surviving postponements and resumptions.

mod common;

use common::*;
use tenacity_core::error::FlowError;
use tenacity_core::invocation::FlowContext;
use tenacity_core::outcome::Outcome;
use tenacity_core::status::Status;

#[tokio::test]
async fn test_scrapbook_survives_postponements() {
    let runtime = memory_runtime().await;
    let journal = runtime.register_flow("journal", |_: (), ctx: FlowContext<Vec<String>>| {
        async move {
            let entries = ctx.state.with(|log| {
                log.push(format!("{:?}@{}", ctx.mode, ctx.epoch));
                log.len()
            });
            if entries < 3 {
                Outcome::postpone_for(chrono::Duration::milliseconds(20))
            } else {
                Outcome::Succeed(ctx.state.snapshot())
            }
        }
    });

    let err = journal.invoke("progress", ()).await.unwrap_err();
    assert!(matches!(err, FlowError::Postponed { .. }));

    let id = journal.flow_id("progress");
    let flow = wait_for_status(runtime.store().as_ref(), &id, Status::Succeeded).await;
    // Two postpone round trips (each +2) then the success commit.
    assert_eq!(flow.epoch, 5);

    let log: Vec<String> = journal.invoke("progress", ()).await.unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0], "Direct@0");
    assert_eq!(log[1], "Retry@2");
    assert_eq!(log[2], "Retry@4");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reinvoke_can_edit_the_scrapbook_first() {
    let runtime = memory_runtime().await;
    let counter = runtime.register_flow("counter", |_: (), ctx: FlowContext<u32>| async move {
        let seen = ctx.state.snapshot();
        if seen == 0 {
            Outcome::postpone_for(chrono::Duration::days(365))
        } else {
            Outcome::Succeed(seen)
        }
    });

    let err = counter.invoke("nudged", ()).await.unwrap_err();
    assert!(matches!(err, FlowError::Postponed { .. }));

    // Resume far ahead of the deadline, bumping the state so the flow takes
    // its success path this time.
    let result = counter
        .reinvoke_updating("nudged", &[Status::Postponed], Some(1), |state| *state = 99)
        .await
        .unwrap();
    assert_eq!(result, 99);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reinvoke_rejects_wrong_status_and_epoch() {
    let runtime = memory_runtime().await;
    let flow = runtime.register_flow("strict", |_: (), _ctx: FlowContext<()>| async move {
        Outcome::Succeed(1u32)
    });

    flow.invoke("done", ()).await.unwrap();

    // Succeeded is not a resumable status.
    let err = flow
        .reinvoke("done", &[Status::Postponed, Status::Failed], None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::UnexpectedState { .. }));
    assert!(err.is_lost_race());

    // Right status set, stale epoch.
    let failing = runtime.register_flow("strict-fail", |_: (), _ctx: FlowContext<()>| async move {
        Outcome::<u32>::fail("boom")
    });
    failing.invoke("stale", ()).await.unwrap_err();
    let err = failing
        .reinvoke("stale", &[Status::Failed], Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::UnexpectedState { .. }));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_flow_cannot_be_reinvoked() {
    let runtime = memory_runtime().await;
    let flow = runtime.register_flow("lost", |_: (), _ctx: FlowContext<()>| async move {
        Outcome::Succeed(())
    });

    let err = flow
        .reinvoke("never-created", &[Status::Postponed], None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::FlowNotFound { .. }));

    runtime.shutdown().await.unwrap();
}
