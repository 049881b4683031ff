// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composable invocation middleware.
//!
//! Cross-cutting behavior (logging, metrics, argument enrichment, guard
//! checks) wraps flow execution as an ordered chain. Each middleware receives
//! the parameter, the attempt context and a [`Next`] continuation; it may pass
//! through, rewrite the parameter, or short-circuit with an outcome of its
//! own. The chain runs inside the attempt, so anything a middleware returns is
//! persisted exactly like an outcome produced by user code.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::context::{FlowContext, FlowFn};
use crate::outcome::Outcome;

/// One layer of the invocation chain.
pub trait Middleware<P, R, S>: Send + Sync
where
    P: Send + 'static,
    R: Send + 'static,
    S: 'static,
{
    /// Handle one attempt. Call `next.run(param, ctx)` to continue the chain.
    fn handle(
        &self,
        param: P,
        ctx: FlowContext<S>,
        next: Next<P, R, S>,
    ) -> BoxFuture<'static, Outcome<R>>;
}

/// Continuation into the rest of the chain, ending at the user's flow code.
pub struct Next<P, R, S> {
    chain: Arc<[Arc<dyn Middleware<P, R, S>>]>,
    index: usize,
    terminal: FlowFn<P, R, S>,
}

impl<P, R, S> Next<P, R, S>
where
    P: Send + 'static,
    R: Send + 'static,
    S: 'static,
{
    pub(crate) fn new(
        chain: Arc<[Arc<dyn Middleware<P, R, S>>]>,
        terminal: FlowFn<P, R, S>,
    ) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// Run the remaining layers and finally the flow code itself.
    pub fn run(self, param: P, ctx: FlowContext<S>) -> BoxFuture<'static, Outcome<R>> {
        match self.chain.get(self.index) {
            Some(layer) => {
                let layer = Arc::clone(layer);
                let rest = Self {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                layer.handle(param, ctx, rest)
            }
            None => (self.terminal)(param, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FlowId;
    use crate::invocation::context::{InvocationMode, StateHandle, into_flow_fn};
    use crate::outcome::Outcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx() -> FlowContext<()> {
        FlowContext::new(
            FlowId::new("order", "abc"),
            0,
            InvocationMode::Direct,
            StateHandle::default(),
        )
    }

    struct Doubler;

    impl Middleware<u32, u32, ()> for Doubler {
        fn handle(
            &self,
            param: u32,
            ctx: FlowContext<()>,
            next: Next<u32, u32, ()>,
        ) -> BoxFuture<'static, Outcome<u32>> {
            next.run(param * 2, ctx)
        }
    }

    struct Refuser;

    impl Middleware<u32, u32, ()> for Refuser {
        fn handle(
            &self,
            _param: u32,
            _ctx: FlowContext<()>,
            _next: Next<u32, u32, ()>,
        ) -> BoxFuture<'static, Outcome<u32>> {
            Box::pin(async { Outcome::fail("refused") })
        }
    }

    struct Counter(Arc<AtomicUsize>);

    impl Middleware<u32, u32, ()> for Counter {
        fn handle(
            &self,
            param: u32,
            ctx: FlowContext<()>,
            next: Next<u32, u32, ()>,
        ) -> BoxFuture<'static, Outcome<u32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(param, ctx)
        }
    }

    fn terminal() -> FlowFn<u32, u32, ()> {
        into_flow_fn(|param: u32, _ctx| async move { Outcome::Succeed(param + 1) })
    }

    #[tokio::test]
    async fn test_empty_chain_runs_flow_code() {
        let chain: Arc<[Arc<dyn Middleware<u32, u32, ()>>]> = Arc::from(vec![].into_boxed_slice());
        let outcome = Next::new(chain, terminal()).run(10, test_ctx()).await;
        assert_eq!(outcome, Outcome::Succeed(11));
    }

    #[tokio::test]
    async fn test_layers_run_in_order() {
        let chain: Arc<[Arc<dyn Middleware<u32, u32, ()>>]> =
            Arc::from(vec![Arc::new(Doubler) as Arc<dyn Middleware<u32, u32, ()>>].into_boxed_slice());
        // Doubler rewrites the parameter before the flow code adds one.
        let outcome = Next::new(chain, terminal()).run(10, test_ctx()).await;
        assert_eq!(outcome, Outcome::Succeed(21));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_layers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain: Arc<[Arc<dyn Middleware<u32, u32, ()>>]> = Arc::from(
            vec![
                Arc::new(Refuser) as Arc<dyn Middleware<u32, u32, ()>>,
                Arc::new(Counter(Arc::clone(&calls))) as Arc<dyn Middleware<u32, u32, ()>>,
            ]
            .into_boxed_slice(),
        );
        let outcome = Next::new(chain, terminal()).run(10, test_ctx()).await;
        assert!(matches!(outcome, Outcome::Fail(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
