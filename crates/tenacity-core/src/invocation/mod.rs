// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The invocation protocol: typed entry points over epoch-gated persistence.

pub mod common;
pub mod context;
pub mod invoker;
pub mod middleware;
mod scheduler;
pub mod shutdown;

pub use common::{CommonInvoker, ErrorSink, Persisted, Prepared, RunGuard, TracingErrorSink};
pub use context::{FlowContext, FlowFn, FlowState, InvocationMode, StateHandle};
pub use invoker::{FlowInvoker, FlowValue, Reinvoker};
pub use middleware::{Middleware, Next};
pub use shutdown::ShutdownCoordinator;
