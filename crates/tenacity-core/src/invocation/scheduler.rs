// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process wakeup timers for postponed flows.
//!
//! When an attempt postpones, the process that committed the postponement
//! schedules its own timer so resumption does not wait for the next watchdog
//! sweep. The timer is purely a latency optimization: it tolerates losing the
//! resumption race, and if the process dies the watchdog resumes the flow
//! from the durable record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::identity::FlowId;
use crate::status::{Epoch, Status};

use super::invoker::Reinvoker;

/// Sleep until `resume_at`, then fire a race-tolerant resumption.
pub(crate) fn spawn_wakeup(
    reinvoker: Arc<dyn Reinvoker>,
    id: FlowId,
    resume_at: DateTime<Utc>,
    expected_epoch: Option<Epoch>,
) {
    tokio::spawn(async move {
        let delay = (resume_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!(flow_id = %id, "Wakeup timer fired");
        reinvoker.schedule_reinvoke(id, vec![Status::Postponed], expected_epoch, true);
    });
}
