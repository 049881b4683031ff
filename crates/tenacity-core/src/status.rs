// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow lifecycle status and the epoch counter.
//!
//! Every durable flow record is in exactly one [`Status`] and carries an
//! [`Epoch`]. The epoch is the optimistic-concurrency fence: every successful
//! conditional update increments it by exactly one, and every mutation must
//! supply the epoch it expects the record to hold. A stale executor's commit
//! is rejected by that comparison, which is what guarantees at-most-one
//! successful commit per attempt.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic per-instance counter gating every conditional update.
pub type Epoch = i32;

/// Lifecycle state of a durable flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// An attempt is (believed to be) in flight; the row holds a lease.
    Executing,
    /// The flow finished with a result. Terminal.
    Succeeded,
    /// The flow finished with an error. Terminal, but may be manually retried,
    /// which bumps the epoch and returns to [`Status::Executing`].
    Failed,
    /// The flow asked to resume automatically at or after a timestamp.
    Postponed,
    /// The flow is waiting indefinitely for external interrupts.
    Suspended,
}

impl Status {
    /// Storage representation (lower-case, matches the database columns).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Postponed => "postponed",
            Self::Suspended => "suspended",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "executing" => Some(Self::Executing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "postponed" => Some(Self::Postponed),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }

    /// Whether a new attempt may be elected leader from this status.
    ///
    /// `Postponed` re-enters automatically; `Failed` and `Suspended` re-enter
    /// via manual retry or an external interrupt.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Postponed | Self::Failed | Self::Suspended)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
