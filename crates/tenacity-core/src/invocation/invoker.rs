// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed flow invocation.
//!
//! [`FlowInvoker`] binds one registered flow type to its parameter, result and
//! auxiliary-state types and drives the full attempt protocol: create-or-wait
//! deduplication, middleware, outcome persistence, and the fire-and-forget
//! wakeup after a postponement. `R = ()` models flows without a return value
//! and `S = ()` flows without auxiliary state, so one generic type covers
//! every combination.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::FlowError;
use crate::identity::{FlowId, FlowInstance, FlowType};
use crate::outcome::Outcome;
use crate::status::{Epoch, Status};

use super::common::CommonInvoker;
use super::context::{FlowContext, FlowFn, FlowState, InvocationMode, StateHandle};
use super::middleware::{Middleware, Next};
use super::scheduler::spawn_wakeup;

/// Parameter and result types must cross task boundaries and the store.
///
/// `Sync` is required because background attempts hold a reference to the
/// outcome across the commit await.
pub trait FlowValue: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> FlowValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Object-safe resumption facet of a typed invoker.
///
/// The watchdog and the in-process wakeup timer hold flows only by identity;
/// this trait lets them resume a flow without knowing its parameter or result
/// types. Resumption is fire-and-forget: the attempt runs on a background
/// task and reports failures to the unhandled-error sink.
pub trait Reinvoker: Send + Sync {
    /// The flow type this reinvoker executes.
    fn flow_type(&self) -> &FlowType;

    /// Spawn a resumption attempt for a persisted flow.
    ///
    /// With `tolerate_lost_race`, losing leader election (another process
    /// resumed the flow first) is logged at debug level and otherwise ignored.
    fn schedule_reinvoke(
        &self,
        id: FlowId,
        expected_statuses: Vec<Status>,
        expected_epoch: Option<Epoch>,
        tolerate_lost_race: bool,
    );
}

/// Typed entry point for one registered flow.
pub struct FlowInvoker<P, R, S = ()> {
    flow_type: FlowType,
    common: Arc<CommonInvoker>,
    flow_fn: FlowFn<P, R, S>,
    middleware: Arc<[Arc<dyn Middleware<P, R, S>>]>,
}

impl<P, R, S> Clone for FlowInvoker<P, R, S> {
    fn clone(&self) -> Self {
        Self {
            flow_type: self.flow_type.clone(),
            common: Arc::clone(&self.common),
            flow_fn: Arc::clone(&self.flow_fn),
            middleware: Arc::clone(&self.middleware),
        }
    }
}

impl<P, R, S> FlowInvoker<P, R, S>
where
    P: FlowValue,
    R: FlowValue,
    S: FlowState,
{
    pub(crate) fn new(
        flow_type: FlowType,
        common: Arc<CommonInvoker>,
        flow_fn: FlowFn<P, R, S>,
        middleware: Vec<Arc<dyn Middleware<P, R, S>>>,
    ) -> Self {
        Self {
            flow_type,
            common,
            flow_fn,
            middleware: Arc::from(middleware.into_boxed_slice()),
        }
    }

    /// Build the full id of an instance of this flow type.
    pub fn flow_id(&self, instance: impl Into<FlowInstance>) -> FlowId {
        FlowId {
            flow_type: self.flow_type.clone(),
            instance: instance.into(),
        }
    }

    /// Invoke a flow and wait for its result.
    ///
    /// At most one execution runs per flow id: the caller that inserts the
    /// record executes the flow, every concurrent caller with the same id
    /// waits for that execution's result instead. A postponed outcome is
    /// returned as [`FlowError::Postponed`] after a background wakeup has been
    /// scheduled; the flow will complete on a later attempt.
    pub async fn invoke(
        &self,
        instance: impl Into<FlowInstance>,
        param: P,
    ) -> Result<R, FlowError> {
        let id = self.flow_id(instance);
        let param_bytes = serde_json::to_vec(&param)?;

        let persisted = self.common.persist_flow(&id, &param_bytes, None).await?;
        match persisted.guard {
            Some(guard) => {
                debug!(flow_id = %id, "Executing new flow");
                let outcome = self
                    .run_attempt(&id, 0, InvocationMode::Direct, param, StateHandle::default(), guard)
                    .await?;
                CommonInvoker::ensure_success(&id, outcome)
            }
            None => {
                debug!(flow_id = %id, "Waiting for the already-running execution");
                self.common.wait_for_result(&id).await
            }
        }
    }

    /// Invoke a flow without waiting for its result.
    ///
    /// The attempt runs on a background task; failures go to the
    /// unhandled-error sink, postponements reschedule themselves. Returns the
    /// flow id once the record is durably persisted (or found existing).
    pub async fn schedule(
        &self,
        instance: impl Into<FlowInstance>,
        param: P,
    ) -> Result<FlowId, FlowError> {
        let id = self.flow_id(instance);
        let param_bytes = serde_json::to_vec(&param)?;

        let persisted = self.common.persist_flow(&id, &param_bytes, None).await?;
        if let Some(guard) = persisted.guard {
            let this = self.clone();
            let task_id = id.clone();
            tokio::spawn(async move {
                let result = this
                    .run_attempt(
                        &task_id,
                        0,
                        InvocationMode::Direct,
                        param,
                        StateHandle::default(),
                        guard,
                    )
                    .await;
                this.conclude_background(&task_id, result);
            });
        }
        Ok(id)
    }

    /// Persist a flow to start no earlier than `at`.
    ///
    /// The record is created already postponed; an in-process timer wakes it
    /// at the deadline, and the watchdog sweep picks it up if this process
    /// dies first. Returns the flow id.
    pub async fn schedule_at(
        &self,
        instance: impl Into<FlowInstance>,
        param: P,
        at: DateTime<Utc>,
    ) -> Result<FlowId, FlowError> {
        let id = self.flow_id(instance);
        let param_bytes = serde_json::to_vec(&param)?;

        let persisted = self.common.persist_flow(&id, &param_bytes, Some(at)).await?;
        if persisted.created {
            info!(flow_id = %id, at = %at, "Scheduled delayed flow");
            spawn_wakeup(Arc::new(self.clone()), id.clone(), at, Some(0));
        }
        Ok(id)
    }

    /// Resume a persisted flow and wait for the attempt's result.
    ///
    /// The flow's current status must be one of `expected_statuses` and, when
    /// supplied, its epoch must equal `expected_epoch`; otherwise
    /// [`FlowError::UnexpectedState`] is returned without touching the record.
    pub async fn reinvoke(
        &self,
        instance: impl Into<FlowInstance>,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<R, FlowError> {
        self.reinvoke_updating(instance, expected_statuses, expected_epoch, |_| {})
            .await
    }

    /// [`FlowInvoker::reinvoke`] with a pre-attempt edit of the auxiliary
    /// state, applied after leader election and before user code runs.
    pub async fn reinvoke_updating(
        &self,
        instance: impl Into<FlowInstance>,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
        update: impl FnOnce(&mut S) + Send,
    ) -> Result<R, FlowError> {
        let id = self.flow_id(instance);
        let outcome = self
            .reinvoke_attempt(&id, expected_statuses, expected_epoch, update)
            .await?;
        CommonInvoker::ensure_success(&id, outcome)
    }

    async fn reinvoke_attempt(
        &self,
        id: &FlowId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
        update: impl FnOnce(&mut S) + Send,
    ) -> Result<Outcome<R>, FlowError> {
        let prepared = self
            .common
            .prepare_reinvocation::<P, S>(id, expected_statuses, expected_epoch)
            .await?;
        prepared.state.with(update);
        self.run_attempt(
            id,
            prepared.epoch,
            InvocationMode::Retry,
            prepared.param,
            prepared.state,
            prepared.guard,
        )
        .await
    }

    /// Run user code through the middleware chain and commit the outcome.
    async fn run_attempt(
        &self,
        id: &FlowId,
        epoch: Epoch,
        mode: InvocationMode,
        param: P,
        state: StateHandle<S>,
        guard: super::common::RunGuard,
    ) -> Result<Outcome<R>, FlowError> {
        let ctx = FlowContext::new(id.clone(), epoch, mode, state.clone());
        let outcome = Next::new(Arc::clone(&self.middleware), Arc::clone(&self.flow_fn))
            .run(param, ctx)
            .await;

        // The commit may convert the outcome (a suspend that raced an
        // interrupt is persisted as an immediate postpone); everything below
        // acts on what was actually written.
        let outcome = self.common.persist_result(id, outcome, &state, epoch).await?;
        debug!(flow_id = %id, epoch, status = %outcome.status(), "Committed attempt outcome");

        if let Outcome::Postpone(resume_at) = &outcome {
            // The commit bumped the epoch; the wakeup resumes against it.
            spawn_wakeup(Arc::new(self.clone()), id.clone(), *resume_at, Some(epoch + 1));
        }

        drop(guard);
        Ok(outcome)
    }

    /// Route a background attempt's conclusion to the unhandled-error sink.
    fn conclude_background(&self, id: &FlowId, result: Result<Outcome<R>, FlowError>) {
        match result {
            Ok(outcome) => self.common.report_failure(id, &outcome),
            Err(FlowError::ShuttingDown) => {
                debug!(flow_id = %id, "Attempt abandoned during shutdown");
            }
            Err(error) => self.common.error_sink().report(&error),
        }
    }
}

impl<P, R, S> Reinvoker for FlowInvoker<P, R, S>
where
    P: FlowValue,
    R: FlowValue,
    S: FlowState,
{
    fn flow_type(&self) -> &FlowType {
        &self.flow_type
    }

    fn schedule_reinvoke(
        &self,
        id: FlowId,
        expected_statuses: Vec<Status>,
        expected_epoch: Option<Epoch>,
        tolerate_lost_race: bool,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this
                .reinvoke_attempt(&id, &expected_statuses, expected_epoch, |_| {})
                .await;
            match result {
                Ok(outcome) => this.common.report_failure(&id, &outcome),
                Err(FlowError::UnexpectedState { .. }) if tolerate_lost_race => {
                    // Another process (or the direct caller's own wakeup)
                    // already resumed this flow.
                    debug!(flow_id = %id, "Lost resumption race, skipping");
                }
                Err(FlowError::ShuttingDown) => {
                    debug!(flow_id = %id, "Resumption refused during shutdown");
                }
                Err(error) => this.common.error_sink().report(&error),
            }
        });
    }
}
