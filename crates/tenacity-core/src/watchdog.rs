// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery and wakeup sweep.
//!
//! The watchdog is the durable counterpart of the in-process wakeup timers:
//! each tick it (a) reclaims executing flows whose lease expired, putting them
//! back in line as immediately-eligible postponed flows with a bumped epoch so
//! the crashed attempt's late commit is rejected, and (b) resumes postponed
//! flows whose deadline has passed via the registered reinvoker for their
//! type. Any replica can reclaim any flow; the sweep is idempotent because
//! every resumption is epoch-gated.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::registry::FlowRegistry;
use crate::status::Status;
use crate::storage::FlowStore;

/// Background worker running the crash-recovery and wakeup sweep.
pub(crate) struct Watchdog {
    store: Arc<dyn FlowStore>,
    registry: Arc<FlowRegistry>,
    settings: RuntimeSettings,
}

impl Watchdog {
    pub(crate) fn new(
        store: Arc<dyn FlowStore>,
        registry: Arc<FlowRegistry>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    /// Run until the shutdown signal flips.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.settings.watchdog_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_ms = self.settings.watchdog_interval.as_millis() as u64,
            "Watchdog started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Watchdog shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep: reclaim crashed attempts, then resume eligible flows.
    pub(crate) async fn sweep_once(&self) {
        let now = Utc::now();

        match self.store.reschedule_crashed(now).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                info!(reclaimed, "Reclaimed flows with expired leases");
            }
            Err(e) => {
                warn!(error = %e, "Crash-recovery reclaim failed");
            }
        }

        let eligible = match self.store.get_eligible_postponed(now).await {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(error = %e, "Failed to list eligible postponed flows");
                return;
            }
        };

        for (id, epoch) in eligible {
            match self.registry.get(&id.flow_type) {
                Some(reinvoker) => {
                    debug!(flow_id = %id, epoch, "Resuming eligible postponed flow");
                    reinvoker.schedule_reinvoke(id, vec![Status::Postponed], Some(epoch), true);
                }
                None => {
                    // Another replica with the type registered will pick it up.
                    warn!(flow_id = %id, "No reinvoker registered for flow type, skipping");
                }
            }
        }
    }
}
