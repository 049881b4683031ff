// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graceful-shutdown coordination for in-flight attempts.
//!
//! Every attempt registers with the coordinator before touching the store and
//! deregisters on every exit path. Shutdown flips a flag refusing new work and
//! waits for the in-flight counter to drain; running user code is tracked,
//! never interrupted (a lease-expired executor is fenced by the epoch, not
//! cancelled).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::error::FlowError;

/// Process-wide tracker of in-flight execution attempts.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    drained: Notify,
}

impl ShutdownCoordinator {
    /// Create a coordinator accepting new work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one attempt. Fails once shutdown has begun.
    pub fn register(&self) -> Result<(), FlowError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FlowError::ShuttingDown);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // Re-check: shutdown may have begun between the check and the add.
        if self.shutting_down.load(Ordering::SeqCst) {
            self.release();
            return Err(FlowError::ShuttingDown);
        }
        Ok(())
    }

    /// Deregister one attempt.
    pub fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Number of attempts currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new registrations and wait until in-flight attempts drain.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }
    }
}
