// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Epoch-gated persistence primitives shared by every invoker.
//!
//! The [`CommonInvoker`] owns the four operations the invocation protocol is
//! built from: persisting a brand-new flow, waiting for a concurrently
//! running flow's result, winning leader election for a reinvocation, and
//! committing an attempt's outcome. Every mutation is gated on the epoch the
//! caller expects; a mismatch is a hard stop, never a silent retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::config::RuntimeSettings;
use crate::error::FlowError;
use crate::identity::{FlowId, ReplicaId};
use crate::lease::LeaseMonitor;
use crate::outcome::{FlowFailure, Outcome};
use crate::status::{Epoch, Status};
use crate::storage::{FlowStore, SuspendResult};

use super::context::{FlowState, StateHandle};
use super::shutdown::ShutdownCoordinator;

/// Sink for errors raised by background (scheduled) executions.
///
/// Fire-and-forget tasks never let an error escape the task; everything is
/// funneled here instead so failures are observable without a listener.
pub trait ErrorSink: Send + Sync {
    /// Report one unhandled error.
    fn report(&self, error: &FlowError);
}

/// Default sink: log through `tracing`.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &FlowError) {
        error!(code = error.error_code(), %error, "Unhandled flow error");
    }
}

/// Sentinel for a guard that never claimed a lease entry.
const UNTRACKED: Epoch = -1;

/// Tracks one in-flight attempt with the shutdown coordinator and the lease
/// monitor. Released on every exit path when dropped.
///
/// The guard starts without a lease entry and claims one only once its
/// caller actually owns an attempt ([`RunGuard::arm`]). It remembers the
/// epoch it tracks under so that dropping it only releases its own entry,
/// never one a newer attempt of the same flow re-tracked.
pub struct RunGuard {
    flow_id: FlowId,
    epoch: AtomicI32,
    shutdown: Arc<ShutdownCoordinator>,
    monitor: Arc<LeaseMonitor>,
}

impl RunGuard {
    /// Claim the lease entry for this attempt at the given epoch.
    pub(crate) fn arm(&self, epoch: Epoch) {
        self.monitor.track(self.flow_id.clone(), epoch);
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    /// Update the tracked epoch after leader election bound a new one.
    pub(crate) fn rebind_epoch(&self, epoch: Epoch) {
        self.monitor.rebind(&self.flow_id, epoch);
        self.epoch.store(epoch, Ordering::SeqCst);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if epoch != UNTRACKED {
            self.monitor.release(&self.flow_id, epoch);
        }
        self.shutdown.release();
    }
}

/// Result of [`CommonInvoker::persist_flow`].
pub struct Persisted {
    /// Whether a new record was inserted. `false` means a record already
    /// existed and the caller must wait for that execution's result.
    pub created: bool,
    /// Attempt registration, present only when this caller owns an attempt.
    pub guard: Option<RunGuard>,
}

/// Result of [`CommonInvoker::prepare_reinvocation`]: the elected attempt.
pub struct Prepared<P, S> {
    /// Deserialized invocation parameter.
    pub param: P,
    /// Deserialized auxiliary state (or default for the first attempt).
    pub state: StateHandle<S>,
    /// The epoch this attempt commits against.
    pub epoch: Epoch,
    /// Attempt registration.
    pub guard: RunGuard,
}

/// Shared persistence logic of all typed invokers.
pub struct CommonInvoker {
    store: Arc<dyn FlowStore>,
    settings: RuntimeSettings,
    replica: ReplicaId,
    shutdown: Arc<ShutdownCoordinator>,
    monitor: Arc<LeaseMonitor>,
    error_sink: Arc<dyn ErrorSink>,
}

impl CommonInvoker {
    /// Wire up the shared invoker state.
    pub fn new(
        store: Arc<dyn FlowStore>,
        settings: RuntimeSettings,
        replica: ReplicaId,
        shutdown: Arc<ShutdownCoordinator>,
        monitor: Arc<LeaseMonitor>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            store,
            settings,
            replica,
            shutdown,
            monitor,
            error_sink,
        }
    }

    /// The flow store this invoker persists through.
    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    /// Timing knobs.
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// This process's replica identity.
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// The unhandled-error sink for background executions.
    pub fn error_sink(&self) -> &Arc<dyn ErrorSink> {
        &self.error_sink
    }

    /// The shutdown coordinator tracking in-flight attempts.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        Utc::now() + self.settings.lease_chrono()
    }

    fn begin_attempt(&self, id: &FlowId) -> Result<RunGuard, FlowError> {
        self.shutdown.register()?;
        Ok(RunGuard {
            flow_id: id.clone(),
            epoch: AtomicI32::new(UNTRACKED),
            shutdown: Arc::clone(&self.shutdown),
            monitor: Arc::clone(&self.monitor),
        })
    }

    /// Persist a brand-new flow record at epoch 0.
    ///
    /// Inserted as `Executing` (direct/scheduled invocation) or `Postponed`
    /// when `postpone_until` is supplied (delayed scheduling). Idempotent:
    /// when a record already exists nothing is written, no attempt is
    /// registered, and the caller must observe the existing execution.
    pub async fn persist_flow(
        &self,
        id: &FlowId,
        param: &[u8],
        postpone_until: Option<DateTime<Utc>>,
    ) -> Result<Persisted, FlowError> {
        let guard = self.begin_attempt(id)?;
        let created = self
            .store
            .create_flow(
                id,
                id.instance.as_str(),
                param,
                self.lease_deadline(),
                postpone_until,
                None,
                Some(self.replica),
            )
            .await?;

        if !created {
            debug!(flow_id = %id, "Flow already exists, deferring to the running execution");
            return Ok(Persisted {
                created: false,
                guard: None,
            });
        }

        // A delayed flow has no attempt in flight; nothing to lease-track.
        let guard = if postpone_until.is_none() {
            guard.arm(0);
            Some(guard)
        } else {
            None
        };
        Ok(Persisted { created: true, guard })
    }

    /// Poll the store until the flow's status leaves `Executing`, then map the
    /// terminal state to a result.
    ///
    /// This is how a caller that lost the create race still observes the
    /// winner's outcome. The wait is deliberately unbounded; callers that need
    /// a timeout must wrap it.
    pub async fn wait_for_result<R: DeserializeOwned>(&self, id: &FlowId) -> Result<R, FlowError> {
        loop {
            let flow = self
                .store
                .get_flow(id)
                .await?
                .ok_or_else(|| FlowError::FlowNotFound {
                    flow_id: id.clone(),
                })?;

            match flow.status {
                Status::Executing => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                Status::Succeeded => {
                    let bytes = flow.result.unwrap_or_else(|| b"null".to_vec());
                    return Ok(serde_json::from_slice(&bytes)?);
                }
                Status::Failed => {
                    let failure = decode_failure(flow.error.as_deref());
                    return Err(FlowError::FlowFailed {
                        flow_id: id.clone(),
                        failure,
                    });
                }
                Status::Postponed => {
                    return Err(FlowError::Postponed {
                        flow_id: id.clone(),
                        resume_at: flow.postpone_until.unwrap_or_else(Utc::now),
                    });
                }
                Status::Suspended => {
                    return Err(FlowError::Suspended {
                        flow_id: id.clone(),
                    });
                }
            }
        }
    }

    /// [`CommonInvoker::wait_for_result`] for flows without a return value.
    pub async fn wait_for_completion(&self, id: &FlowId) -> Result<(), FlowError> {
        self.wait_for_result::<()>(id).await
    }

    /// Leader election for a reinvocation.
    ///
    /// Validates that the current status is in `expected_statuses` (and the
    /// epoch matches, when supplied), then issues the conditional
    /// become-leader transition. Exactly one concurrent caller per epoch wins;
    /// losers get [`FlowError::UnexpectedState`].
    pub async fn prepare_reinvocation<P, S>(
        &self,
        id: &FlowId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<Prepared<P, S>, FlowError>
    where
        P: DeserializeOwned,
        S: FlowState,
    {
        let flow = self
            .store
            .get_flow(id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound {
                flow_id: id.clone(),
            })?;

        if !expected_statuses.contains(&flow.status) {
            return Err(FlowError::UnexpectedState {
                flow_id: id.clone(),
                expected: format_status_set(expected_statuses),
                actual: flow.status.to_string(),
            });
        }
        if let Some(expected) = expected_epoch
            && expected != flow.epoch
        {
            return Err(FlowError::UnexpectedState {
                flow_id: id.clone(),
                expected: format!("epoch {}", expected),
                actual: format!("epoch {}", flow.epoch),
            });
        }

        let guard = self.begin_attempt(id)?;
        guard.arm(flow.epoch + 1);
        let elected = self
            .store
            .restart_execution(id, flow.epoch, self.lease_deadline(), self.replica)
            .await?;

        let Some(elected) = elected else {
            // Another process won the race between our read and the update.
            return Err(FlowError::UnexpectedState {
                flow_id: id.clone(),
                expected: format!("epoch {}", flow.epoch),
                actual: "lost leader election".to_string(),
            });
        };

        guard.rebind_epoch(elected.epoch);

        let param: P = serde_json::from_slice(&elected.param)?;
        let state: S = match elected.state.as_deref() {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => S::default(),
        };

        debug!(flow_id = %id, epoch = elected.epoch, "Won leader election for reinvocation");

        Ok(Prepared {
            param,
            state: StateHandle::new(state),
            epoch: elected.epoch,
            guard,
        })
    }

    /// Commit an attempt's outcome through exactly one epoch-gated update.
    ///
    /// Returns the outcome that was actually persisted. It differs from the
    /// input in one case: a suspend that raced an already-delivered interrupt
    /// is committed as an immediate postponement, and the caller must treat
    /// the attempt as postponed, not suspended.
    ///
    /// A rejected write means another executor (typically crash recovery)
    /// mutated the record out from under this attempt; the result must not be
    /// trusted or blindly re-committed, so this surfaces as
    /// [`FlowError::ConcurrentModification`].
    pub async fn persist_result<R, S>(
        &self,
        id: &FlowId,
        outcome: Outcome<R>,
        state: &StateHandle<S>,
        expected_epoch: Epoch,
    ) -> Result<Outcome<R>, FlowError>
    where
        R: Serialize,
        S: FlowState,
    {
        let state_bytes = state.to_bytes()?;
        let mut converted_at = None;
        let committed = match &outcome {
            Outcome::Succeed(value) => {
                let result = serde_json::to_vec(value)?;
                self.store
                    .succeed_flow(id, &result, Some(&state_bytes), expected_epoch)
                    .await?
            }
            Outcome::Postpone(until) => {
                self.store
                    .postpone_flow(id, *until, Some(&state_bytes), expected_epoch)
                    .await?
            }
            Outcome::Fail(failure) => {
                let error = serde_json::to_vec(failure)?;
                self.store
                    .fail_flow(id, &error, Some(&state_bytes), expected_epoch)
                    .await?
            }
            Outcome::Suspend { expected_interrupts } => {
                match self
                    .store
                    .suspend_flow(id, *expected_interrupts, Some(&state_bytes), expected_epoch)
                    .await?
                {
                    SuspendResult::Suspended => true,
                    SuspendResult::WasInterrupted => {
                        // Interrupts already arrived; postpone for immediate
                        // resumption instead of losing the wakeup.
                        debug!(flow_id = %id, "Suspend raced an interrupt, postponing instead");
                        let resume_at = Utc::now();
                        let committed = self
                            .store
                            .postpone_flow(id, resume_at, Some(&state_bytes), expected_epoch)
                            .await?;
                        if committed {
                            converted_at = Some(resume_at);
                        }
                        committed
                    }
                    SuspendResult::Conflict => false,
                }
            }
        };

        if !committed {
            return Err(FlowError::ConcurrentModification {
                flow_id: id.clone(),
                expected_epoch,
            });
        }
        match converted_at {
            Some(resume_at) => Ok(Outcome::Postpone(resume_at)),
            None => Ok(outcome),
        }
    }

    /// Map a committed outcome to the direct caller's result: the success
    /// value, or the corresponding error for failure, postponement and
    /// suspension.
    pub fn ensure_success<R>(flow_id: &FlowId, outcome: Outcome<R>) -> Result<R, FlowError> {
        match outcome {
            Outcome::Succeed(value) => Ok(value),
            Outcome::Postpone(resume_at) => Err(FlowError::Postponed {
                flow_id: flow_id.clone(),
                resume_at,
            }),
            Outcome::Suspend { .. } => Err(FlowError::Suspended {
                flow_id: flow_id.clone(),
            }),
            Outcome::Fail(failure) => Err(FlowError::FlowFailed {
                flow_id: flow_id.clone(),
                failure,
            }),
        }
    }

    /// Report a failed outcome to the unhandled-error sink. Used by
    /// fire-and-forget paths where postponement and suspension are tolerated.
    pub fn report_failure<R>(&self, flow_id: &FlowId, outcome: &Outcome<R>) {
        if let Outcome::Fail(failure) = outcome {
            self.error_sink.report(&FlowError::FlowFailed {
                flow_id: flow_id.clone(),
                failure: failure.clone(),
            });
        }
    }

    /// Convenience used by wait paths in tests and callers that poll with a
    /// bound: the configured polling interval.
    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }
}

fn decode_failure(bytes: Option<&[u8]>) -> FlowFailure {
    bytes
        .and_then(|b| serde_json::from_slice(b).ok())
        .unwrap_or_else(|| FlowFailure::message("flow failed without a recorded error"))
}

fn format_status_set(statuses: &[Status]) -> String {
    let names: Vec<&str> = statuses.iter().map(Status::as_str).collect();
    format!("{{{}}}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_status_set() {
        assert_eq!(
            format_status_set(&[Status::Postponed, Status::Failed]),
            "{postponed, failed}"
        );
        assert_eq!(format_status_set(&[]), "{}");
    }

    #[test]
    fn test_decode_failure_falls_back_on_garbage() {
        let failure = decode_failure(Some(b"not json"));
        assert_eq!(failure.code, "FLOW_FAILED");
        let failure = decode_failure(None);
        assert_eq!(failure.code, "FLOW_FAILED");
    }

    #[test]
    fn test_ensure_success_maps_outcomes() {
        let id = FlowId::new("order", "abc-123");
        assert_eq!(CommonInvoker::ensure_success(&id, Outcome::Succeed(7)).unwrap(), 7);

        let err = CommonInvoker::ensure_success::<i32>(&id, Outcome::fail("boom")).unwrap_err();
        assert!(matches!(err, FlowError::FlowFailed { .. }));

        let err =
            CommonInvoker::ensure_success::<i32>(&id, Outcome::Postpone(Utc::now())).unwrap_err();
        assert!(matches!(err, FlowError::Postponed { .. }));

        let err =
            CommonInvoker::ensure_success::<i32>(&id, Outcome::suspend_after(1)).unwrap_err();
        assert!(matches!(err, FlowError::Suspended { .. }));
    }
}
