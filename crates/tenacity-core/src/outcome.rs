// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The result of a single execution attempt.
//!
//! User code communicates control flow through the [`Outcome`] tagged union
//! rather than through the error channel: postponement and suspension are
//! cooperative signals, not faults. An outcome is never persisted directly;
//! the common invoker translates it into a status plus payload and commits it
//! through one epoch-gated store call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// What one execution attempt of a flow produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The flow completed with a value.
    Succeed(T),
    /// The flow asks to be resumed automatically at or after the timestamp.
    Postpone(DateTime<Utc>),
    /// The flow waits indefinitely until its interrupt counter reaches the
    /// given total. Resumed only by external interrupts, never by a timer.
    Suspend {
        /// Total interrupt count at which the flow becomes eligible to resume.
        expected_interrupts: i64,
    },
    /// The flow failed. Persisted and rethrown to direct callers.
    Fail(FlowFailure),
}

impl<T> Outcome<T> {
    /// Postpone relative to now.
    pub fn postpone_for(delay: Duration) -> Self {
        Self::Postpone(Utc::now() + delay)
    }

    /// Suspend until one more interrupt than have been seen when the suspend
    /// commits. The common case: wait for the next external event.
    pub fn suspend_after(expected_interrupts: i64) -> Self {
        Self::Suspend { expected_interrupts }
    }

    /// Fail with a message, using the default failure code.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(FlowFailure::message(message))
    }

    /// The status this outcome maps to when persisted.
    pub fn status(&self) -> Status {
        match self {
            Self::Succeed(_) => Status::Succeeded,
            Self::Postpone(_) => Status::Postponed,
            Self::Suspend { .. } => Status::Suspended,
            Self::Fail(_) => Status::Failed,
        }
    }
}

/// A serializable description of a flow failure.
///
/// Stored alongside the record so the original error can be rethrown later,
/// on a different process, with the origin flow's identity attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFailure {
    /// Machine-readable error code (e.g. `"PAYMENT_DECLINED"`).
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl FlowFailure {
    /// Create a failure with an explicit code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a failure with the generic `FLOW_FAILED` code.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("FLOW_FAILED", message)
    }
}

impl std::fmt::Display for FlowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
