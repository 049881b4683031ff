// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-attempt execution context handed to user code.
//!
//! The context carries the flow identity, the epoch the attempt is committing
//! against, whether this is a fresh invocation or a resumption, and the
//! auxiliary state handle (the "scrapbook"). Passing an explicit context
//! object instead of ambient task-local state keeps resumption observable and
//! trivially testable.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::FlowError;
use crate::identity::FlowId;
use crate::outcome::Outcome;
use crate::status::Epoch;

/// Auxiliary state bound 1:1 to a flow instance.
///
/// Serialized alongside the flow record after every attempt and deserialized
/// (or defaulted) before the next one, so mid-flow progress survives crashes.
/// Blanket-implemented; any default-constructible serde type qualifies.
pub trait FlowState: Default + Serialize + DeserializeOwned + Send + 'static {}

impl<T> FlowState for T where T: Default + Serialize + DeserializeOwned + Send + 'static {}

/// Shared handle to a flow's auxiliary state.
///
/// Owned exclusively by one in-flight attempt; the handle is shared only
/// between the user code and the invoker that persists it afterwards.
pub struct StateHandle<S> {
    inner: Arc<Mutex<S>>,
}

impl<S: FlowState> StateHandle<S> {
    /// Wrap an existing state value.
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Run a closure against the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Replace the state wholesale.
    pub fn replace(&self, state: S) {
        self.with(|current| *current = state);
    }

    /// Snapshot the current state.
    pub fn snapshot(&self) -> S
    where
        S: Clone,
    {
        self.with(|state| state.clone())
    }

    /// Serialize the current state for persistence.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, FlowError> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(serde_json::to_vec(&*guard)?)
    }
}

impl<S: FlowState> Default for StateHandle<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for StateHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle").finish_non_exhaustive()
    }
}

/// Whether the current execution is a first attempt or a resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// First attempt of this flow instance (epoch 0).
    Direct,
    /// Resumption after postponement, suspension, failure or crash recovery.
    Retry,
}

/// Context passed to user code for every attempt.
pub struct FlowContext<S = ()> {
    /// The flow being executed.
    pub flow_id: FlowId,
    /// The epoch this attempt will commit against.
    pub epoch: Epoch,
    /// First attempt or resumption.
    pub mode: InvocationMode,
    /// The flow's auxiliary state.
    pub state: StateHandle<S>,
}

impl<S: FlowState> FlowContext<S> {
    /// Build a context for one attempt.
    pub fn new(flow_id: FlowId, epoch: Epoch, mode: InvocationMode, state: StateHandle<S>) -> Self {
        Self {
            flow_id,
            epoch,
            mode,
            state,
        }
    }
}

impl<S> Clone for FlowContext<S> {
    fn clone(&self) -> Self {
        Self {
            flow_id: self.flow_id.clone(),
            epoch: self.epoch,
            mode: self.mode,
            state: self.state.clone(),
        }
    }
}

/// Canonical shape of user flow code: every supported callable form is
/// adapted into this one async-outcome-returning function type.
pub type FlowFn<P, R, S> =
    Arc<dyn Fn(P, FlowContext<S>) -> BoxFuture<'static, Outcome<R>> + Send + Sync>;

/// Adapt a plain async closure into the canonical [`FlowFn`] shape.
pub(crate) fn into_flow_fn<P, R, S, F, Fut>(f: F) -> FlowFn<P, R, S>
where
    F: Fn(P, FlowContext<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome<R>> + Send + 'static,
{
    Arc::new(move |param, ctx| Box::pin(f(param, ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_handle_is_shared_between_clones() {
        let handle: StateHandle<Vec<u32>> = StateHandle::default();
        let clone = handle.clone();
        clone.with(|v| v.push(7));
        assert_eq!(handle.snapshot(), vec![7]);
    }

    #[test]
    fn test_state_handle_serializes_current_value() {
        let handle = StateHandle::new(3u32);
        handle.with(|v| *v += 1);
        let bytes = handle.to_bytes().unwrap();
        assert_eq!(bytes, b"4");
    }

    #[tokio::test]
    async fn test_into_flow_fn_adapts_async_closures() {
        let f: FlowFn<u32, u32, ()> = into_flow_fn(|param: u32, _ctx| async move {
            Outcome::Succeed(param * 2)
        });
        let ctx = FlowContext::new(
            FlowId::new("order", "abc"),
            0,
            InvocationMode::Direct,
            StateHandle::default(),
        );
        assert_eq!(f(21, ctx).await, Outcome::Succeed(42));
    }
}
