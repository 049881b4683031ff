// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sign-of-life lease renewal.
//!
//! Every executing attempt holds a time-bounded lease recorded on its row.
//! The [`LeaseMonitor`] tracks which attempts this process has in flight and
//! the [`LeaseRenewer`] worker extends their leases at half the lease length.
//! Renewal is gated on the attempt's epoch, so a flow reclaimed by crash
//! recovery is never re-leased by its stale executor. Renewal failures are
//! logged, not fatal: the epoch fence is the correctness mechanism, the lease
//! only bounds how long a crash goes unnoticed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::identity::FlowId;
use crate::status::Epoch;
use crate::storage::FlowStore;

/// Registry of the attempts this process currently executes.
#[derive(Debug, Default)]
pub struct LeaseMonitor {
    active: Mutex<HashMap<FlowId, Epoch>>,
}

impl LeaseMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlowId, Epoch>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking an attempt at the given epoch.
    pub fn track(&self, id: FlowId, epoch: Epoch) {
        self.lock().insert(id, epoch);
    }

    /// Update the tracked epoch after leader election bound a new one.
    pub fn rebind(&self, id: &FlowId, epoch: Epoch) {
        if let Some(entry) = self.lock().get_mut(id) {
            *entry = epoch;
        }
    }

    /// Stop tracking an attempt, but only if it still holds the entry.
    ///
    /// A newer attempt of the same flow may have re-tracked the id at a
    /// higher epoch; a finishing older attempt must not evict it.
    pub fn release(&self, id: &FlowId, epoch: Epoch) {
        let mut active = self.lock();
        if active.get(id) == Some(&epoch) {
            active.remove(id);
        }
    }

    /// Snapshot of all tracked attempts.
    pub fn snapshot(&self) -> Vec<(FlowId, Epoch)> {
        self.lock()
            .iter()
            .map(|(id, epoch)| (id.clone(), *epoch))
            .collect()
    }
}

/// Background worker renewing the leases of tracked attempts.
pub(crate) struct LeaseRenewer {
    store: Arc<dyn FlowStore>,
    monitor: Arc<LeaseMonitor>,
    settings: RuntimeSettings,
}

impl LeaseRenewer {
    pub(crate) fn new(
        store: Arc<dyn FlowStore>,
        monitor: Arc<LeaseMonitor>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            store,
            monitor,
            settings,
        }
    }

    /// Run until the shutdown signal flips.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.lease_length / 2;
        let mut tick = interval(period.max(std::time::Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(period_ms = period.as_millis() as u64, "Lease renewer started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.renew_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Lease renewer shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn renew_once(&self) {
        let leases = self.monitor.snapshot();
        if leases.is_empty() {
            return;
        }
        let new_expiration = Utc::now() + self.settings.lease_chrono();
        match self.store.renew_leases(&leases, new_expiration).await {
            Ok(renewed) => {
                debug!(tracked = leases.len(), renewed, "Renewed leases");
                if renewed < leases.len() as u64 {
                    // The shortfall lost its epoch race (reclaimed or committed
                    // elsewhere); its commit will be rejected by the store.
                    warn!(
                        tracked = leases.len(),
                        renewed, "Some tracked attempts no longer hold their lease"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Lease renewal failed");
            }
        }
    }
}
