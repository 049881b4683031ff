// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenacity Core - Durable Flow Execution Engine
//!
//! This crate provides a durable-execution engine: user code ("flows") whose
//! invocations are persisted, deduplicated, resumable and crash-safe. A flow
//! instance survives process restarts; at most one execution of it commits an
//! outcome per epoch, no matter how many processes race to run it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Application Code                        │
//! │        runtime.register_flow("order", |param, ctx| …)        │
//! └──────────────────────────────────────────────────────────────┘
//!                │ invoke / schedule / reinvoke
//!                ▼
//! ┌──────────────────────┐      ┌─────────────────────────────────┐
//! │  FlowInvoker<P,R,S>  │─────▶│  CommonInvoker                  │
//! │  (typed, middleware) │      │  persist / elect / commit       │
//! └──────────────────────┘      └─────────────────────────────────┘
//!                ▲                              │ epoch-gated updates
//!                │ resume by FlowType           ▼
//! ┌──────────────────────┐      ┌─────────────────────────────────┐
//! │  Watchdog sweep      │─────▶│  FlowStore (SQLite / in-memory) │
//! │  + LeaseRenewer      │      │  one row per flow instance      │
//! └──────────────────────┘      └─────────────────────────────────┘
//! ```
//!
//! # Flow Status State Machine
//!
//! ```text
//!                    ┌───────────┐
//!       create ─────▶│ EXECUTING │◀───── restart_execution
//!                    └─────┬─────┘       (leader election,
//!          ┌───────────┬───┴────┬─────┐   epoch + 1)
//!          │           │        │     │
//!      succeed     postpone  suspend fail
//!          │           │        │     │
//!          ▼           ▼        ▼     ▼
//!    ┌───────────┐ ┌─────────┐ ┌─────────┐ ┌────────┐
//!    │ SUCCEEDED │ │POSTPONED│ │SUSPENDED│ │ FAILED │
//!    └───────────┘ └────┬────┘ └────┬────┘ └───┬────┘
//!                       │           │          │
//!                  deadline    interrupts   explicit
//!                  reached      reached     reinvoke
//!                       │      (→POSTPONED)   │
//!                       └───────────┴─────────┘
//!                                   │
//!                              back to EXECUTING
//! ```
//!
//! Every committed transition increments the record's epoch by exactly one;
//! an update carrying a stale epoch touches zero rows and the attempt that
//! issued it learns it lost. Crash recovery is the same mechanism: the
//! watchdog moves an executing flow with an expired lease back to
//! `POSTPONED` with a bumped epoch, so the crashed (or merely slow) attempt's
//! late commit is rejected.
//!
//! # Invocation Semantics
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `invoke` | Run the flow, or wait for the already-running execution with the same id |
//! | `schedule` | Persist and run on a background task, errors to the unhandled-error sink |
//! | `schedule_at` | Persist as postponed until a deadline, then resume automatically |
//! | `reinvoke` | Resume a postponed/suspended/failed flow and wait for the attempt |
//! | `interrupt` | Deliver an external wakeup; a suspended flow resumes when enough arrive |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TENACITY_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `TENACITY_LEASE_LENGTH_MS` | No | `10000` | Executing-attempt lease length |
//! | `TENACITY_POLL_INTERVAL_MS` | No | `100` | Result polling interval |
//! | `TENACITY_WATCHDOG_INTERVAL_MS` | No | `1000` | Crash-recovery sweep interval |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types with stable error code mapping
//! - [`identity`]: Flow, instance and replica identifiers
//! - [`invocation`]: Typed invokers, middleware and the attempt protocol
//! - [`lease`]: Sign-of-life lease renewal for in-flight attempts
//! - [`outcome`]: The outcome union returned by flow code
//! - [`registry`]: Flow type registry used for resumption
//! - [`runtime`]: Embeddable runtime wiring stores, workers and registration
//! - [`status`]: Flow lifecycle statuses and the epoch counter
//! - [`storage`]: The flow store contract and its backends

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations with stable error codes.
pub mod error;

/// Flow, instance and replica identifiers.
pub mod identity;

/// Typed invokers, middleware, and the epoch-gated attempt protocol.
pub mod invocation;

/// Lease tracking and sign-of-life renewal for in-flight attempts.
pub mod lease;

/// The outcome union flow code concludes with.
pub mod outcome;

/// Registry mapping flow types to their resumption entry points.
pub mod registry;

/// Embeddable runtime: store + background workers + flow registration.
pub mod runtime;

/// Flow lifecycle statuses and the optimistic-concurrency epoch.
pub mod status;

/// Durable flow storage: the contract and the SQLite/in-memory backends.
pub mod storage;

mod watchdog;
