// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the invocation surface: invoke, schedule,
//! schedule_at, deduplication, middleware and the postpone round trip.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use futures::future::BoxFuture;
use tenacity_core::error::FlowError;
use tenacity_core::identity::ReplicaId;
use tenacity_core::invocation::{
    CommonInvoker, FlowContext, Middleware, Next, ShutdownCoordinator, StateHandle,
    TracingErrorSink,
};
use tenacity_core::lease::LeaseMonitor;
use tenacity_core::outcome::{FlowFailure, Outcome};
use tenacity_core::status::Status;
use tenacity_core::storage::{FlowStore, InMemoryFlowStore};

#[tokio::test]
async fn test_invoke_returns_value_and_persists_record() {
    let runtime = memory_runtime().await;
    let doubler = runtime.register_flow("doubler", |n: u32, _ctx: FlowContext<()>| async move {
        Outcome::Succeed(n * 2)
    });

    let result = doubler.invoke("first", 21).await.expect("invoke should succeed");
    assert_eq!(result, 42);

    let flow = runtime
        .store()
        .get_flow(&doubler.flow_id("first"))
        .await
        .unwrap()
        .expect("record should exist");
    assert_eq!(flow.status, Status::Succeeded);
    assert_eq!(flow.epoch, 1);
    assert_eq!(flow.result.as_deref(), Some(b"42".as_slice()));
    assert!(flow.lease_expiration.is_none());
    assert!(flow.owner.is_none());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_invocations_run_user_code_once() {
    let runtime = memory_runtime().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let slow = runtime.register_flow("slow", move |_: (), _ctx: FlowContext<()>| {
        let counted = Arc::clone(&counted);
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Outcome::Succeed(7u32)
        }
    });

    let (a, b) = tokio::join!(slow.invoke("dup", ()), slow.invoke("dup", ()));
    assert_eq!(a.expect("winner should succeed"), 7);
    assert_eq!(b.expect("loser should observe the winner's result"), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "user code must run exactly once");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_is_rethrown_to_every_caller() {
    let runtime = memory_runtime().await;
    let failing = runtime.register_flow("payment", |_: (), _ctx: FlowContext<()>| async move {
        Outcome::<u32>::Fail(FlowFailure::new("PAYMENT_DECLINED", "card expired"))
    });

    let err = failing.invoke("order-1", ()).await.unwrap_err();
    let FlowError::FlowFailed { failure, .. } = err else {
        panic!("expected FlowFailed, got {err:?}");
    };
    assert_eq!(failure.code, "PAYMENT_DECLINED");

    // A later caller with the same id gets the persisted failure, not a rerun.
    let err = failing.invoke("order-1", ()).await.unwrap_err();
    let FlowError::FlowFailed { failure, flow_id } = err else {
        panic!("expected FlowFailed on replay");
    };
    assert_eq!(failure.message, "card expired");
    assert_eq!(flow_id, failing.flow_id("order-1"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schedule_completes_in_background() {
    let runtime = memory_runtime().await;
    let adder = runtime.register_flow("adder", |n: u32, _ctx: FlowContext<()>| async move {
        Outcome::Succeed(n + 1)
    });

    let id = adder.schedule("bg", 41).await.expect("schedule should persist");
    let flow = wait_for_status(runtime.store().as_ref(), &id, Status::Succeeded).await;
    assert_eq!(flow.result.as_deref(), Some(b"42".as_slice()));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schedule_carries_owned_values_across_tasks() {
    let runtime = memory_runtime().await;
    let greeter =
        runtime.register_flow("greeter", |name: String, _ctx: FlowContext<()>| async move {
            Outcome::Succeed(format!("hello, {name}"))
        });

    let id = greeter.schedule("owned", "world".to_string()).await.unwrap();
    let flow = wait_for_status(runtime.store().as_ref(), &id, Status::Succeeded).await;
    assert_eq!(flow.result.as_deref(), Some(b"\"hello, world\"".as_slice()));

    let replay: String = greeter.invoke("owned", "world".to_string()).await.unwrap();
    assert_eq!(replay, "hello, world");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schedule_at_starts_after_deadline() {
    let runtime = memory_runtime().await;
    let delayed = runtime.register_flow("delayed", |n: u32, _ctx: FlowContext<()>| async move {
        Outcome::Succeed(n)
    });

    let at = chrono::Utc::now() + chrono::Duration::milliseconds(80);
    let id = delayed.schedule_at("later", 5, at).await.expect("schedule_at");

    let flow = runtime.store().get_flow(&id).await.unwrap().unwrap();
    assert_eq!(flow.status, Status::Postponed);
    assert_eq!(flow.epoch, 0);
    assert_eq!(flow.postpone_until, Some(at));

    let flow = wait_for_status(runtime.store().as_ref(), &id, Status::Succeeded).await;
    // Create at 0, leader election to 1, success commit to 2.
    assert_eq!(flow.epoch, 2);
    assert!(flow.status_changed_at >= at - chrono::Duration::milliseconds(20));

    runtime.shutdown().await.unwrap();
}

struct AddTen;

impl Middleware<u32, u32, ()> for AddTen {
    fn handle(
        &self,
        param: u32,
        ctx: FlowContext<()>,
        next: Next<u32, u32, ()>,
    ) -> BoxFuture<'static, Outcome<u32>> {
        next.run(param + 10, ctx)
    }
}

#[tokio::test]
async fn test_middleware_wraps_invocation() {
    let runtime = memory_runtime().await;
    let wrapped = runtime.register_flow_with_middleware(
        "wrapped",
        vec![Arc::new(AddTen)],
        |n: u32, _ctx: FlowContext<()>| async move { Outcome::Succeed(n * 2) },
    );

    let result = wrapped.invoke("mw", 5).await.unwrap();
    assert_eq!(result, 30, "middleware rewrites the parameter before user code");

    runtime.shutdown().await.unwrap();
}

/// The canonical epoch walkthrough: create at 0, postpone commits to 1,
/// leader election to 2, success commit to 3.
#[tokio::test]
async fn test_postpone_round_trip_epoch_sequence() {
    let runtime = memory_runtime().await;
    let order = runtime.register_flow("order", |_: (), ctx: FlowContext<u32>| async move {
        let attempts = ctx.state.with(|a| {
            *a += 1;
            *a
        });
        if attempts == 1 {
            Outcome::postpone_for(chrono::Duration::milliseconds(30))
        } else {
            Outcome::Succeed("done".to_string())
        }
    });

    let err = order.invoke("abc-123", ()).await.unwrap_err();
    assert!(matches!(err, FlowError::Postponed { .. }));

    let id = order.flow_id("abc-123");
    let flow = wait_for_status(runtime.store().as_ref(), &id, Status::Succeeded).await;
    assert_eq!(flow.epoch, 3);

    // A second caller finds the finished record and gets its result.
    let result = order.invoke("abc-123", ()).await.unwrap();
    assert_eq!(result, "done");

    runtime.shutdown().await.unwrap();
}

/// An attempt whose record was moved on by another executor must not have its
/// commit accepted, and must see the rejection as a fatal error.
#[tokio::test]
async fn test_commit_behind_attempts_back_is_rejected() {
    init_tracing();
    let store: Arc<dyn FlowStore> = Arc::new(InMemoryFlowStore::new());
    let common = CommonInvoker::new(
        Arc::clone(&store),
        fast_settings(),
        ReplicaId::generate(),
        Arc::new(ShutdownCoordinator::new()),
        Arc::new(LeaseMonitor::new()),
        Arc::new(TracingErrorSink),
    );

    let id = tenacity_core::identity::FlowId::new("order", "undercut");
    let persisted = common.persist_flow(&id, b"{}", None).await.unwrap();
    assert!(persisted.created);

    // Crash recovery on another replica decides the attempt is dead and
    // reschedules the flow while the attempt is still running.
    assert!(
        store
            .postpone_flow(&id, chrono::Utc::now(), None, 0)
            .await
            .unwrap()
    );

    let err = common
        .persist_result(&id, Outcome::Succeed(7u32), &StateHandle::<()>::default(), 0)
        .await
        .unwrap_err();
    let FlowError::ConcurrentModification { flow_id, expected_epoch } = err else {
        panic!("expected ConcurrentModification, got {err:?}");
    };
    assert_eq!(flow_id, id);
    assert_eq!(expected_epoch, 0);

    // The interloper's state stands untouched by the rejected commit.
    let flow = store.get_flow(&id).await.unwrap().unwrap();
    assert_eq!(flow.status, Status::Postponed);
    assert_eq!(flow.epoch, 1);
    assert!(flow.result.is_none());
}
